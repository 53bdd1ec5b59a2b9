pub mod chrome;

use crate::config::Config;
use crate::db::UrlRow;
use crate::history::HistoryBackend;
use crate::history::types::normalize_url;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub urls: usize,
    pub terms: usize,
}

impl ImportSummary {
    fn merge(self, other: Self) -> Self {
        Self {
            urls: self.urls + other.urls,
            terms: self.terms + other.terms,
        }
    }
}

/// Merges one Chrome History file into the store. Known URLs keep the
/// larger counts and the later visit time; an empty title is filled in.
pub fn import_chrome_history(backend: &HistoryBackend, history_path: &Path) -> Result<ImportSummary> {
    let history = chrome::read_profile_history(history_path)?;
    let db = backend.db();

    let mut ids = HashMap::with_capacity(history.urls.len());
    for chrome_row in history.urls {
        let url = normalize_url(&chrome_row.url);
        let id = match db.get_row_for_url(&url)? {
            Some(mut row) => {
                row.visit_count = row.visit_count.max(chrome_row.visit_count);
                row.typed_count = row.typed_count.max(chrome_row.typed_count);
                row.last_visit = row.last_visit.max(chrome_row.last_visit);
                if row.title.is_empty() {
                    row.title = chrome_row.title;
                }
                db.insert_or_update_url_row_by_id(&row)?;
                row.id
            }
            None => db.add_url(&UrlRow {
                id: 0,
                url,
                ..chrome_row
            })?,
        };
        ids.insert(chrome_row.id, id);
    }

    let mut terms = 0;
    for term in history.terms {
        let Some(url_id) = ids.get(&term.url_id) else {
            warn!(url_id = term.url_id, "Skipping Chrome search term without a URL");
            continue;
        };
        if db.set_keyword_search_terms_for_url(*url_id, term.keyword_id, &term.term)? {
            terms += 1;
        }
    }

    let summary = ImportSummary {
        urls: ids.len(),
        terms,
    };
    info!(
        path = %history_path.display(),
        urls = summary.urls,
        terms = summary.terms,
        "Imported Chrome history"
    );
    Ok(summary)
}

/// Imports every configured profile that has a History file, or just
/// `profile` when given.
pub fn import_chrome_profiles(
    backend: &HistoryBackend,
    config: &Config,
    profile: Option<&str>,
) -> Result<ImportSummary> {
    let profiles = match profile {
        Some(profile) => vec![profile.to_string()],
        None => config.chrome_profiles.clone(),
    };

    profiles
        .iter()
        .map(|profile| chrome::profile_history_path(profile))
        .filter(|path| {
            let exists = path.exists();
            if !exists {
                warn!(path = %path.display(), "Chrome History not found");
            }
            exists
        })
        .try_fold(ImportSummary::default(), |total, path| {
            Ok(total.merge(import_chrome_history(backend, &path)?))
        })
}
