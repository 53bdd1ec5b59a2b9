use super::{Database, KeywordSearchTermRow, from_db_time, prefix_upper_bound, to_db_time};
use crate::search_terms::{KeywordSearchTermVisit, normalize_term};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Rows, Statement, params};
use tracing::warn;

const VISIT_FIELDS: &str = "kst.term, kst.normalized_term, u.visit_count, u.last_visit_time";

fn visit_from(row: &Row<'_>) -> rusqlite::Result<KeywordSearchTermVisit> {
    Ok(KeywordSearchTermVisit {
        term: row.get(0)?,
        normalized_term: row.get(1)?,
        visit_count: row.get(2)?,
        last_visit_time: from_db_time(row.get(3)?),
        score: None,
    })
}

fn term_row_from(row: &Row<'_>) -> rusqlite::Result<KeywordSearchTermRow> {
    Ok(KeywordSearchTermRow {
        keyword_id: row.get(0)?,
        url_id: row.get(1)?,
        term: row.get(2)?,
        normalized_term: row.get(3)?,
    })
}

enum VisitFilter {
    Prefix { lower: String, upper: String },
    Since { threshold: i64 },
}

/// A prepared term-visit query. Call [`VisitCursor::visits`] to step
/// through the rows.
pub struct VisitCursor<'conn> {
    statement: Statement<'conn>,
    keyword_id: i64,
    filter: VisitFilter,
}

impl<'conn> VisitCursor<'conn> {
    pub fn visits(&mut self) -> Result<KeywordSearchTermVisitEnumerator<'_>> {
        let rows = match &self.filter {
            VisitFilter::Prefix { lower, upper } => {
                self.statement
                    .query(params![self.keyword_id, lower, upper])
            }
            VisitFilter::Since { threshold } => {
                self.statement.query(params![self.keyword_id, threshold])
            }
        }
        .context("Failed to run keyword search term query")?;

        Ok(KeywordSearchTermVisitEnumerator { rows })
    }
}

/// Single-pass cursor over term visits ordered by normalized term and then
/// visit time. A step error is logged and ends the iteration.
pub struct KeywordSearchTermVisitEnumerator<'stmt> {
    rows: Rows<'stmt>,
}

impl Iterator for KeywordSearchTermVisitEnumerator<'_> {
    type Item = KeywordSearchTermVisit;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rows.next() {
            Ok(Some(row)) => match visit_from(row) {
                Ok(visit) => Some(visit),
                Err(error) => {
                    warn!(error = %error, "Skipping unreadable keyword search term rows");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "Keyword search term enumeration failed");
                None
            }
        }
    }
}

impl Database {
    /// Records that `term` was searched with `keyword_id` and landed on
    /// `url_id`. The first term stored for a (keyword, url) pair wins.
    pub fn set_keyword_search_terms_for_url(
        &self,
        url_id: i64,
        keyword_id: i64,
        term: &str,
    ) -> Result<bool> {
        if url_id == 0 || keyword_id == 0 || term.is_empty() {
            warn!(url_id, keyword_id, "Refusing incomplete keyword search term");
            return Ok(false);
        }

        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM keyword_search_terms WHERE keyword_id = ?1 AND url_id = ?2",
                params![keyword_id, url_id],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to look up keyword search term")?
            .is_some();
        if exists {
            return Ok(true);
        }

        self.conn
            .execute(
                "INSERT INTO keyword_search_terms (keyword_id, url_id, term, normalized_term)
                 VALUES (?1, ?2, ?3, ?4)",
                params![keyword_id, url_id, term, normalize_term(term)],
            )
            .context("Failed to insert keyword search term")?;

        Ok(true)
    }

    pub fn get_keyword_search_term_row(&self, url_id: i64) -> Result<Option<KeywordSearchTermRow>> {
        self.conn
            .query_row(
                "SELECT keyword_id, url_id, term, normalized_term
                 FROM keyword_search_terms WHERE url_id = ?1",
                params![url_id],
                term_row_from,
            )
            .optional()
            .context("Failed to read keyword search term")
    }

    pub fn get_keyword_search_term_rows(&self, term: &str) -> Result<Vec<KeywordSearchTermRow>> {
        let mut statement = self.conn.prepare(
            "SELECT keyword_id, url_id, term, normalized_term
             FROM keyword_search_terms WHERE term = ?1",
        )?;

        let rows = statement
            .query_map(params![term], term_row_from)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query keyword search terms")?;

        Ok(rows)
    }

    pub fn delete_all_search_terms_for_keyword(&self, keyword_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM keyword_search_terms WHERE keyword_id = ?1",
                params![keyword_id],
            )
            .context("Failed to delete search terms for keyword")
    }

    pub fn delete_keyword_search_term(&self, term: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM keyword_search_terms WHERE term = ?1",
                params![term],
            )
            .context("Failed to delete keyword search term")
    }

    pub fn delete_keyword_search_term_for_normalized_term(
        &self,
        keyword_id: i64,
        normalized_term: &str,
    ) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM keyword_search_terms WHERE keyword_id = ?1 AND normalized_term = ?2",
                params![keyword_id, normalized_term],
            )
            .context("Failed to delete normalized keyword search term")
    }

    pub fn delete_keyword_search_term_for_url(&self, url_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM keyword_search_terms WHERE url_id = ?1",
                params![url_id],
            )
            .context("Failed to delete keyword search terms for URL")
    }

    /// URL ids whose stored term for `keyword_id` normalizes to
    /// `normalized_term`.
    pub fn get_url_ids_for_normalized_term(
        &self,
        keyword_id: i64,
        normalized_term: &str,
    ) -> Result<Vec<i64>> {
        let mut statement = self.conn.prepare(
            "SELECT url_id FROM keyword_search_terms
             WHERE keyword_id = ?1 AND normalized_term = ?2",
        )?;

        let ids = statement
            .query_map(params![keyword_id, normalized_term], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()
            .context("Failed to query URLs for search term")?;

        Ok(ids)
    }

    /// Most recent distinct terms for `keyword_id` starting with `prefix`,
    /// one row per normalized term.
    pub fn get_most_recent_keyword_search_terms(
        &self,
        keyword_id: i64,
        prefix: &str,
        max_count: usize,
    ) -> Result<Vec<KeywordSearchTermVisit>> {
        let lower = normalize_term(prefix);
        let Some(upper) = prefix_upper_bound(&lower) else {
            return Ok(Vec::new());
        };
        if keyword_id == 0 || max_count == 0 {
            return Ok(Vec::new());
        }

        let mut statement = self.conn.prepare(
            "SELECT kst.term, kst.normalized_term, SUM(u.visit_count),
                    MAX(u.last_visit_time) AS last_visit_time
             FROM keyword_search_terms kst
             JOIN urls u ON kst.url_id = u.id
             WHERE kst.keyword_id = ?1
               AND kst.normalized_term >= ?2
               AND kst.normalized_term < ?3
             GROUP BY kst.normalized_term
             ORDER BY last_visit_time DESC
             LIMIT ?4",
        )?;

        let visits = statement
            .query_map(params![keyword_id, lower, upper, max_count as i64], visit_from)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query recent keyword search terms")?;

        Ok(visits)
    }

    /// Cursor over visits whose normalized term starts with `prefix`. `None`
    /// when there is nothing to enumerate.
    pub fn keyword_search_term_visits_for_prefix(
        &self,
        keyword_id: i64,
        prefix: &str,
    ) -> Result<Option<VisitCursor<'_>>> {
        if keyword_id == 0 {
            return Ok(None);
        }
        let lower = normalize_term(prefix);
        let Some(upper) = prefix_upper_bound(&lower) else {
            return Ok(None);
        };

        let statement = self
            .conn
            .prepare(&format!(
                "SELECT {VISIT_FIELDS}
                 FROM keyword_search_terms kst
                 JOIN urls u ON kst.url_id = u.id
                 WHERE kst.keyword_id = ?1
                   AND kst.normalized_term >= ?2
                   AND kst.normalized_term < ?3
                 ORDER BY kst.normalized_term ASC, u.last_visit_time ASC"
            ))
            .context("Failed to prepare keyword search term prefix query")?;

        Ok(Some(VisitCursor {
            statement,
            keyword_id,
            filter: VisitFilter::Prefix { lower, upper },
        }))
    }

    /// Cursor over non-empty term visits newer than `threshold`.
    pub fn keyword_search_term_visits_since(
        &self,
        keyword_id: i64,
        threshold: DateTime<Utc>,
    ) -> Result<Option<VisitCursor<'_>>> {
        if keyword_id == 0 {
            return Ok(None);
        }

        let statement = self
            .conn
            .prepare(&format!(
                "SELECT {VISIT_FIELDS}
                 FROM keyword_search_terms kst
                 JOIN urls u ON kst.url_id = u.id
                 WHERE kst.keyword_id = ?1
                   AND u.last_visit_time > ?2
                   AND kst.normalized_term IS NOT NULL
                   AND kst.normalized_term != ''
                 ORDER BY kst.normalized_term ASC, u.last_visit_time ASC"
            ))
            .context("Failed to prepare keyword search term age query")?;

        Ok(Some(VisitCursor {
            statement,
            keyword_id,
            filter: VisitFilter::Since {
                threshold: to_db_time(threshold),
            },
        }))
    }
}
