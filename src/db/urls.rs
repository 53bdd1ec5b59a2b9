use super::queries::URL_ROW_FIELDS;
use super::{Database, UrlRow, from_db_time, prefix_upper_bound, to_db_time};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, Rows, Statement, params, params_from_iter};
use tracing::{debug, warn};

/// A URL typed at least this many times is significant.
pub const LOW_QUALITY_MATCH_TYPED_LIMIT: i32 = 1;
/// A URL visited at least this many times is significant.
pub const LOW_QUALITY_MATCH_VISIT_LIMIT: i32 = 4;
/// A URL visited within this many days is significant.
pub const LOW_QUALITY_MATCH_AGE_LIMIT_DAYS: i64 = 3;

pub fn autocomplete_age_threshold(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(LOW_QUALITY_MATCH_AGE_LIMIT_DAYS)
}

pub fn row_qualifies_as_significant(row: &UrlRow, threshold: DateTime<Utc>) -> bool {
    if row.hidden {
        return false;
    }

    row.typed_count >= LOW_QUALITY_MATCH_TYPED_LIMIT
        || row.visit_count >= LOW_QUALITY_MATCH_VISIT_LIMIT
        || row.last_visit >= threshold
}

fn url_row_from(row: &Row<'_>) -> rusqlite::Result<UrlRow> {
    Ok(UrlRow {
        id: row.get(0)?,
        url: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        visit_count: row.get(3)?,
        typed_count: row.get(4)?,
        last_visit: from_db_time(row.get(5)?),
        hidden: row.get(6)?,
    })
}

/// Prepared URL query; [`UrlCursor::rows`] steps through it lazily.
pub struct UrlCursor<'conn> {
    statement: Statement<'conn>,
    params: Vec<i64>,
}

impl<'conn> UrlCursor<'conn> {
    pub fn rows(&mut self) -> Result<UrlEnumerator<'_>> {
        let rows = self
            .statement
            .query(params_from_iter(self.params.iter()))
            .context("Failed to run URL enumeration query")?;
        Ok(UrlEnumerator { rows })
    }
}

pub struct UrlEnumerator<'stmt> {
    rows: Rows<'stmt>,
}

impl Iterator for UrlEnumerator<'_> {
    type Item = UrlRow;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rows.next() {
            Ok(Some(row)) => match url_row_from(row) {
                Ok(url_row) => Some(url_row),
                Err(error) => {
                    warn!(error = %error, "Stopping URL enumeration at unreadable row");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "URL enumeration failed");
                None
            }
        }
    }
}

impl Database {
    pub fn get_url_row(&self, url_id: i64) -> Result<Option<UrlRow>> {
        self.conn
            .query_row(
                &format!("SELECT {URL_ROW_FIELDS} FROM urls WHERE id = ?1"),
                params![url_id],
                url_row_from,
            )
            .optional()
            .context("Failed to read URL row")
    }

    pub fn get_row_for_url(&self, url: &str) -> Result<Option<UrlRow>> {
        self.conn
            .query_row(
                &format!("SELECT {URL_ROW_FIELDS} FROM urls WHERE url = ?1"),
                params![url],
                url_row_from,
            )
            .optional()
            .context("Failed to look up URL")
    }

    /// Writes every field but `id` and `url`. `false` when no row has `url_id`.
    pub fn update_url_row(&self, url_id: i64, row: &UrlRow) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE urls
                 SET title = ?1, visit_count = ?2, typed_count = ?3, last_visit_time = ?4, hidden = ?5
                 WHERE id = ?6",
                params![
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    to_db_time(row.last_visit),
                    row.hidden,
                    url_id
                ],
            )
            .context("Failed to update URL row")?;

        Ok(changed > 0)
    }

    /// Inserts `row` and returns its new id. A non-zero `row.id` is used as
    /// the id.
    pub fn add_url(&self, row: &UrlRow) -> Result<i64> {
        let id = (row.id != 0).then_some(row.id);
        self.conn
            .execute(
                "INSERT INTO urls (id, url, title, visit_count, typed_count, last_visit_time, hidden)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    row.url,
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    to_db_time(row.last_visit),
                    row.hidden
                ],
            )
            .with_context(|| format!("Failed to add URL {}", row.url))?;

        let id = self.conn.last_insert_rowid();
        debug!(url_id = id, url = %row.url, "Added URL row");
        Ok(id)
    }

    pub fn insert_or_update_url_row_by_id(&self, row: &UrlRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO urls (id, url, title, visit_count, typed_count, last_visit_time, hidden)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   url = excluded.url,
                   title = excluded.title,
                   visit_count = excluded.visit_count,
                   typed_count = excluded.typed_count,
                   last_visit_time = excluded.last_visit_time,
                   hidden = excluded.hidden",
                params![
                    row.id,
                    row.url,
                    row.title,
                    row.visit_count,
                    row.typed_count,
                    to_db_time(row.last_visit),
                    row.hidden
                ],
            )
            .context("Failed to insert or update URL row")?;
        Ok(())
    }

    /// Deletes the row and every keyword search term pointing at it.
    pub fn delete_url_row(&self, url_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM urls WHERE id = ?1", params![url_id])
            .context("Failed to delete URL row")?;
        if deleted == 0 {
            return Ok(false);
        }

        self.delete_keyword_search_term_for_url(url_id)?;
        Ok(true)
    }

    /// Empties `urls` and `keyword_search_terms`. Returns the URL count
    /// removed.
    pub fn delete_all_urls(&self) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM urls", [])
            .context("Failed to delete URLs")?;
        self.conn
            .execute("DELETE FROM keyword_search_terms", [])
            .context("Failed to delete keyword search terms")?;
        Ok(deleted)
    }

    pub fn count_urls(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM urls", [], |row| row.get(0))
            .context("Failed to count URLs")
    }

    pub fn all_urls(&self) -> Result<UrlCursor<'_>> {
        let statement = self
            .conn
            .prepare(&format!("SELECT {URL_ROW_FIELDS} FROM urls"))
            .context("Failed to prepare URL enumeration")?;
        Ok(UrlCursor {
            statement,
            params: Vec::new(),
        })
    }

    /// Rows that pass [`row_qualifies_as_significant`], best first.
    pub fn significant_urls(&self, now: DateTime<Utc>, limit: usize) -> Result<UrlCursor<'_>> {
        let statement = self
            .conn
            .prepare(&format!(
                "SELECT {URL_ROW_FIELDS} FROM urls
                 WHERE hidden = 0
                   AND (last_visit_time >= ?1 OR visit_count >= ?2 OR typed_count >= ?3)
                 ORDER BY typed_count DESC, visit_count DESC, last_visit_time DESC
                 LIMIT ?4"
            ))
            .context("Failed to prepare significant URL enumeration")?;
        Ok(UrlCursor {
            statement,
            params: vec![
                to_db_time(autocomplete_age_threshold(now)),
                i64::from(LOW_QUALITY_MATCH_VISIT_LIMIT),
                i64::from(LOW_QUALITY_MATCH_TYPED_LIMIT),
                limit as i64,
            ],
        })
    }

    /// Visible URLs starting with `prefix`, best first.
    pub fn autocomplete_for_prefix(
        &self,
        prefix: &str,
        max_results: usize,
        typed_only: bool,
    ) -> Result<Vec<UrlRow>> {
        let Some(upper) = prefix_upper_bound(prefix) else {
            return Ok(Vec::new());
        };
        let typed_clause = if typed_only { "AND typed_count > 0" } else { "" };

        let mut statement = self.conn.prepare(&format!(
            "SELECT {URL_ROW_FIELDS} FROM urls
             WHERE url >= ?1 AND url < ?2 AND hidden = 0 {typed_clause}
             ORDER BY typed_count DESC, visit_count DESC, last_visit_time DESC
             LIMIT ?3"
        ))?;

        let rows = statement
            .query_map(params![prefix, upper, max_results as i64], url_row_from)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query autocomplete matches")?;

        Ok(rows
            .into_iter()
            .filter(|row| url::Url::parse(&row.url).is_ok())
            .collect())
    }

    /// Scheme of a typed URL on `host`, preferring http over https.
    pub fn is_typed_host(&self, host: &str) -> Result<Option<&'static str>> {
        for scheme in ["http", "https"] {
            let prefix = format!("{scheme}://{host}");
            let upper = format!("{scheme}://{host}0");
            let typed: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM urls
                     WHERE url >= ?1 AND url < ?2 AND typed_count > 0",
                    params![format!("{prefix}/"), upper],
                    |row| row.get(0),
                )
                .context("Failed to look up typed host")?;
            if typed > 0 {
                return Ok(Some(scheme));
            }
        }

        Ok(None)
    }

    /// Shortest visible URL in `[base, url]` that meets the visit
    /// thresholds. `allow_base` decides whether `base` itself may match.
    pub fn find_shortest_url_from_base(
        &self,
        base: &str,
        url: &str,
        min_visits: i32,
        min_typed: i32,
        allow_base: bool,
    ) -> Result<Option<UrlRow>> {
        let operator = if allow_base { ">=" } else { ">" };
        self.conn
            .query_row(
                &format!(
                    "SELECT {URL_ROW_FIELDS} FROM urls
                     WHERE url {operator} ?1 AND url < ?2 AND hidden = 0
                       AND visit_count >= ?3 AND typed_count >= ?4
                     ORDER BY url LIMIT 1"
                ),
                params![base, format!("{url}\u{1}"), min_visits, min_typed],
                url_row_from,
            )
            .optional()
            .context("Failed to find shortest URL from base")
    }

    /// Visible rows where every word of `query` prefixes some word of the
    /// URL or title.
    pub fn get_text_matches(&self, query: &str) -> Result<Vec<UrlRow>> {
        let query_words = split_words(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let mut statement = self.conn.prepare(&format!(
            "SELECT {URL_ROW_FIELDS} FROM urls
             WHERE hidden = 0
             ORDER BY typed_count DESC, visit_count DESC, last_visit_time DESC"
        ))?;
        let rows = statement
            .query_map([], url_row_from)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query text matches")?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                let mut words = split_words(&row.url);
                words.extend(split_words(&row.title));
                query_words
                    .iter()
                    .all(|query_word| words.iter().any(|word| word.starts_with(query_word)))
            })
            .collect())
    }

    /// Visible rows visited within `since`, most visited first.
    pub fn most_visited_urls(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<UrlRow>> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT {URL_ROW_FIELDS} FROM urls
             WHERE hidden = 0 AND last_visit_time >= ?1
             ORDER BY visit_count DESC, last_visit_time DESC
             LIMIT ?2"
        ))?;

        let rows = statement
            .query_map(params![to_db_time(since), limit as i64], url_row_from)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query most visited URLs")?;

        Ok(rows)
    }
}

fn split_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}
