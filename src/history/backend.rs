use crate::config::{Config, RepeatableQueriesConfig};
use crate::db::{Database, UrlRow};
use crate::history::types::{MostVisitedUrl, TopSitesDelta, normalize_url};
use crate::search_terms::aggregate::{autocomplete_search_terms, most_repeated_search_terms};
use crate::search_terms::{KeywordSearchTermVisit, SearchTermRankingPolicy, day_score, normalize_term};
use crate::top_sites::search_provider::SearchProvider;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Synchronous history operations over one open store. Lives on the
/// history worker thread; see [`super::service::HistoryService`].
pub struct HistoryBackend {
    db: Database,
    queries: RepeatableQueriesConfig,
    days_back: i64,
}

impl HistoryBackend {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            queries: config.repeatable_queries.clone(),
            days_back: config.most_visited_days_back,
        }
    }

    pub fn open(config: &Config) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        Ok(Self::new(db, config))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Records one visit and returns the URL id.
    pub fn add_page(
        &self,
        url: &str,
        title: &str,
        visit_time: DateTime<Utc>,
        typed: bool,
    ) -> Result<i64> {
        let url = normalize_url(url);
        let Some(mut row) = self.db.get_row_for_url(&url)? else {
            let mut row = UrlRow::new(url);
            row.title = title.to_string();
            row.visit_count = 1;
            row.typed_count = i32::from(typed);
            row.last_visit = visit_time;
            return self.db.add_url(&row);
        };

        row.visit_count += 1;
        row.typed_count += i32::from(typed);
        row.last_visit = row.last_visit.max(visit_time);
        row.hidden = false;
        if !title.is_empty() {
            row.title = title.to_string();
        }
        self.db.update_url_row(row.id, &row)?;
        debug!(url_id = row.id, visits = row.visit_count, "Recorded visit");
        Ok(row.id)
    }

    /// Attaches a search term to a known URL. Unknown URLs are ignored.
    pub fn set_keyword_search_terms_for_url(
        &self,
        url: &str,
        keyword_id: i64,
        term: &str,
    ) -> Result<bool> {
        let Some(row) = self.db.get_row_for_url(&normalize_url(url))? else {
            warn!(url, keyword_id, "Ignoring search term for unknown URL");
            return Ok(false);
        };
        self.db.set_keyword_search_terms_for_url(row.id, keyword_id, term)
    }

    /// Records a navigation. When `provider` recognizes the URL as one of
    /// its results pages, the search term is stored too and returned.
    pub fn record_visit(
        &self,
        url: &str,
        title: &str,
        visit_time: DateTime<Utc>,
        typed: bool,
        provider: Option<&SearchProvider>,
    ) -> Result<(i64, Option<String>)> {
        let url_id = self.add_page(url, title, visit_time, typed)?;
        let Some((provider, term)) =
            provider.and_then(|provider| Some((provider, provider.extract_search_terms(url)?)))
        else {
            return Ok((url_id, None));
        };
        self.set_keyword_search_terms_for_url(url, provider.keyword_id, &term)?;
        Ok((url_id, Some(term)))
    }

    /// Visits the provider's results page for `term`; returns its URL.
    pub fn record_search(
        &self,
        provider: &SearchProvider,
        term: &str,
        visit_time: DateTime<Utc>,
    ) -> Result<String> {
        let url = provider.search_url(term);
        self.add_page(&url, term, visit_time, false)?;
        self.set_keyword_search_terms_for_url(&url, provider.keyword_id, term)?;
        Ok(url)
    }

    pub fn delete_url(&self, url: &str) -> Result<bool> {
        let Some(row) = self.db.get_row_for_url(&normalize_url(url))? else {
            return Ok(false);
        };
        self.db.delete_url_row(row.id)
    }

    /// Returns the normalized URLs that were actually deleted.
    pub fn delete_urls(&self, urls: &[String]) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for url in urls {
            if self.delete_url(url)? {
                deleted.push(normalize_url(url));
            }
        }
        info!(requested = urls.len(), deleted = deleted.len(), "Deleted URLs");
        Ok(deleted)
    }

    pub fn delete_all_history(&self) -> Result<usize> {
        let deleted = self.db.delete_all_urls()?;
        info!(deleted, "Deleted all history");
        Ok(deleted)
    }

    pub fn delete_all_search_terms_for_keyword(&self, keyword_id: i64) -> Result<usize> {
        self.db.delete_all_search_terms_for_keyword(keyword_id)
    }

    /// Deletes every URL whose term for `keyword_id` normalizes like `term`,
    /// returning those URLs.
    pub fn delete_matching_urls_for_keyword(
        &self,
        keyword_id: i64,
        term: &str,
    ) -> Result<Vec<String>> {
        let normalized = normalize_term(term);
        let mut deleted = Vec::new();
        for url_id in self.db.get_url_ids_for_normalized_term(keyword_id, &normalized)? {
            let Some(row) = self.db.get_url_row(url_id)? else {
                continue;
            };
            if self.db.delete_url_row(url_id)? {
                deleted.push(row.url);
            }
        }
        // Terms whose URL row was already gone.
        self.db
            .delete_keyword_search_term_for_normalized_term(keyword_id, &normalized)?;

        info!(keyword_id, deleted = deleted.len(), "Deleted URLs for search term");
        Ok(deleted)
    }

    pub fn get_most_recent_search_terms(
        &self,
        keyword_id: i64,
        prefix: &str,
        count: usize,
        policy: SearchTermRankingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<KeywordSearchTermVisit>> {
        let Some(mut cursor) = self.db.keyword_search_term_visits_for_prefix(keyword_id, prefix)?
        else {
            return Ok(Vec::new());
        };
        let visits = cursor.visits()?;
        Ok(autocomplete_search_terms(visits, policy, count, now))
    }

    /// Visible URLs from the last `days_back` days, best first.
    pub fn query_most_visited_urls(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MostVisitedUrl>> {
        let since = now - Duration::days(self.days_back);
        let mut sites: Vec<MostVisitedUrl> = self
            .db
            .most_visited_urls(since, limit)
            .context("Failed to read most visited URLs")?
            .into_iter()
            .map(|row| {
                let score = day_score(row.visit_count, row.last_visit, now);
                MostVisitedUrl::new(row.url, row.title, score)
            })
            .collect();
        sites.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(sites)
    }

    pub fn query_most_repeated_queries_for_keyword(
        &self,
        keyword_id: i64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<KeywordSearchTermVisit>> {
        let threshold = now - Duration::days(self.queries.max_age_days);
        let Some(mut cursor) = self.db.keyword_search_term_visits_since(keyword_id, threshold)?
        else {
            return Ok(Vec::new());
        };
        let visits = cursor.visits()?;
        Ok(most_repeated_search_terms(
            visits,
            self.queries.most_repeated_options(),
            limit,
            now,
        ))
    }

    pub fn get_top_sites(&self) -> Result<Vec<MostVisitedUrl>> {
        self.db.get_top_sites()
    }

    pub fn update_top_sites(&mut self, delta: &TopSitesDelta) -> Result<()> {
        self.db.apply_top_sites_delta(delta)
    }
}
