use super::block_list::BlockList;
use super::search_provider::SearchProvider;
use crate::config::RepeatableQueriesConfig;
use crate::history::types::MostVisitedUrl;
use crate::search_terms::KeywordSearchTermVisit;
use std::collections::HashSet;

/// Turns scored search terms into tiles that open the provider's results
/// page.
pub fn query_tiles(
    queries: Vec<KeywordSearchTermVisit>,
    provider: &SearchProvider,
) -> Vec<MostVisitedUrl> {
    queries
        .into_iter()
        .map(|query| MostVisitedUrl {
            url: provider.search_url(&query.normalized_term),
            title: query.term,
            score: query.score.unwrap_or_default(),
        })
        .collect()
}

/// Maps query scores linearly onto the range spanned by site scores. Does
/// nothing if either list is empty or either range is a single point.
pub fn rescale_scores(queries: &mut [MostVisitedUrl], sites: &[MostVisitedUrl]) {
    let (Some((site_min, site_max)), Some((query_min, query_max))) =
        (score_range(sites), score_range(queries))
    else {
        return;
    };
    if site_max - site_min <= f64::EPSILON || query_max - query_min <= f64::EPSILON {
        return;
    }

    let scale = (site_max - site_min) / (query_max - query_min);
    for query in queries {
        query.score = site_min + (query.score - query_min) * scale;
    }
}

fn score_range(list: &[MostVisitedUrl]) -> Option<(f64, f64)> {
    list.iter().map(|site| site.score).fold(None, |range, score| {
        Some(match range {
            None => (score, score),
            Some((min, max)) => (min.min(score), max.max(score)),
        })
    })
}

/// Interleaves two lists by descending score. `primary` wins ties.
pub fn merge_by_score(
    mut primary: Vec<MostVisitedUrl>,
    mut secondary: Vec<MostVisitedUrl>,
) -> Vec<MostVisitedUrl> {
    primary.sort_by(|a, b| b.score.total_cmp(&a.score));
    secondary.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut merged = Vec::with_capacity(primary.len() + secondary.len());
    let mut primary = primary.into_iter().peekable();
    let mut secondary = secondary.into_iter().peekable();
    loop {
        let take_secondary = match (primary.peek(), secondary.peek()) {
            (None, None) => break,
            (Some(first), Some(second)) => second.score > first.score,
            (Some(_), None) => false,
            (None, Some(_)) => true,
        };
        let next = if take_secondary {
            secondary.next()
        } else {
            primary.next()
        };
        merged.extend(next);
    }

    merged
}

/// Drops repeated URLs, keeping the first, and caps the list.
pub fn dedup_and_cap(list: Vec<MostVisitedUrl>, max_size: usize) -> Vec<MostVisitedUrl> {
    let mut seen = HashSet::new();
    list.into_iter()
        .filter(|site| seen.insert(site.url.clone()))
        .take(max_size)
        .collect()
}

/// Builds the authoritative top sites list from one refresh's two reads.
///
/// Without a provider the sites pass through unmerged. With the
/// repeatable-queries feature off, only the best ranked results page of the
/// provider is kept and queries are ignored.
pub fn build_top_sites(
    sites: Vec<MostVisitedUrl>,
    queries: Vec<KeywordSearchTermVisit>,
    provider: Option<&SearchProvider>,
    block_list: &BlockList,
    settings: &RepeatableQueriesConfig,
    max_size: usize,
) -> Vec<MostVisitedUrl> {
    let sites = sites
        .into_iter()
        .filter(|site| !block_list.contains(&site.url));

    let Some(provider) = provider else {
        return dedup_and_cap(sites.collect(), max_size);
    };

    if !settings.enabled {
        let mut results_page_kept = false;
        let sites = sites
            .filter(|site| {
                !provider.is_search_results_page(&site.url)
                    || !std::mem::replace(&mut results_page_kept, true)
            })
            .collect();
        return dedup_and_cap(sites, max_size);
    }

    let mut sites: Vec<MostVisitedUrl> = sites
        .filter(|site| !provider.is_search_results_page(&site.url))
        .collect();

    let mut queries: Vec<MostVisitedUrl> = query_tiles(queries, provider)
        .into_iter()
        .filter(|query| !block_list.contains(&query.url))
        .collect();

    sites.truncate(max_size);
    queries.truncate(max_size.min(settings.max_queries));

    if settings.rescale_scores {
        rescale_scores(&mut queries, &sites);
    }

    let merged = if settings.privilege_queries {
        merge_by_score(queries, sites)
    } else {
        merge_by_score(sites, queries)
    };
    dedup_and_cap(merged, max_size)
}

/// Appends `pages` that are neither listed nor blocked until `list` holds
/// `max_size` entries.
pub fn add_prepopulated_pages(
    list: &mut Vec<MostVisitedUrl>,
    pages: &[MostVisitedUrl],
    block_list: &BlockList,
    max_size: usize,
) -> bool {
    let mut added = false;
    for page in pages {
        if list.len() >= max_size {
            break;
        }
        if block_list.contains(&page.url) || list.iter().any(|site| site.url == page.url) {
            continue;
        }
        list.push(page.clone());
        added = true;
    }
    added
}
