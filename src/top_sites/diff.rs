use crate::history::types::{MostVisitedUrl, MostVisitedUrlWithRank, TopSitesDelta};
use std::collections::HashMap;

/// Compares two ranked lists by URL. Ranks in `added` and `moved` are
/// positions in `new`; ranks in `deleted` are positions in `old`.
pub fn diff_most_visited(old: &[MostVisitedUrl], new: &[MostVisitedUrl]) -> TopSitesDelta {
    let mut old_ranks: HashMap<&str, usize> = HashMap::with_capacity(old.len());
    for (rank, site) in old.iter().enumerate() {
        old_ranks.entry(site.url.as_str()).or_insert(rank);
    }

    let mut delta = TopSitesDelta::default();
    for (rank, site) in new.iter().enumerate() {
        let entry = MostVisitedUrlWithRank {
            url: site.clone(),
            rank,
        };
        match old_ranks.remove(site.url.as_str()) {
            None => delta.added.push(entry),
            Some(old_rank) if old_rank != rank => delta.moved.push(entry),
            Some(_) => {}
        }
    }

    for (rank, site) in old.iter().enumerate() {
        if old_ranks.get(site.url.as_str()) == Some(&rank) {
            delta.deleted.push(MostVisitedUrlWithRank {
                url: site.clone(),
                rank,
            });
        }
    }

    delta
}

pub fn do_titles_differ(old: &[MostVisitedUrl], new: &[MostVisitedUrl]) -> bool {
    old.len() != new.len()
        || old
            .iter()
            .zip(new)
            .any(|(before, after)| before.title != after.title)
}
