pub mod downloads;
pub mod error;
pub mod keyword_terms;
pub mod migrations;
pub mod queries;
pub mod top_sites;
pub mod urls;

pub use error::HistoryDbError;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::cell::Cell;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Schema version written by this build.
pub const CURRENT_VERSION: i64 = 7;
/// Oldest build version that can still read what this build writes.
pub const COMPATIBLE_VERSION: i64 = 4;

const WINDOWS_EPOCH_OFFSET_SECONDS: i64 = 11_644_473_600;
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Stored times are microseconds since 1601-01-01 UTC, the same base Chrome
/// uses in its own History file.
pub fn to_db_time(time: DateTime<Utc>) -> i64 {
    (time.timestamp() + WINDOWS_EPOCH_OFFSET_SECONDS) * MICROS_PER_SECOND
        + i64::from(time.timestamp_subsec_micros())
}

pub fn from_db_time(value: i64) -> DateTime<Utc> {
    let micros = value - WINDOWS_EPOCH_OFFSET_SECONDS * MICROS_PER_SECOND;
    let nanos = (micros.rem_euclid(MICROS_PER_SECOND) * 1_000) as u32;
    DateTime::from_timestamp(micros.div_euclid(MICROS_PER_SECOND), nanos).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub visit_count: i32,
    pub typed_count: i32,
    pub last_visit: DateTime<Utc>,
    pub hidden: bool,
}

impl UrlRow {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: 0,
            url: url.into(),
            title: String::new(),
            visit_count: 0,
            typed_count: 0,
            last_visit: DateTime::<Utc>::default(),
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordSearchTermRow {
    pub keyword_id: i64,
    pub url_id: i64,
    pub term: String,
    pub normalized_term: String,
}

pub struct Database {
    conn: Connection,
    download_cleanup_done: Cell<bool>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite DB: {}", path.display()))?;

        let mut database = Self {
            conn,
            download_cleanup_done: Cell::new(false),
        };
        database.init()?;

        Ok(database)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite DB")?;
        let mut database = Self {
            conn,
            download_cleanup_done: Cell::new(false),
        };
        database.init()?;

        Ok(database)
    }

    fn init(&mut self) -> Result<()> {
        if !self.table_exists("meta")? && !self.table_exists("urls")? {
            return self.init_schema();
        }

        // Nothing may be written before the compatibility check passes.
        let version = self.meta_value("version")?.unwrap_or(1);
        let compatible_version = self
            .meta_value("last_compatible_version")?
            .unwrap_or(version);

        if compatible_version > CURRENT_VERSION {
            return Err(HistoryDbError::TooNew {
                version,
                compatible_version,
                supported: CURRENT_VERSION,
            }
            .into());
        }

        if version > CURRENT_VERSION {
            warn!(
                version,
                supported = CURRENT_VERSION,
                "History database is newer than this build but still compatible"
            );
            return Ok(());
        }

        migrations::run(&mut self.conn, version)
    }

    fn init_schema(&mut self) -> Result<()> {
        let transaction = self
            .conn
            .transaction()
            .context("Failed to start transaction")?;

        queries::schema_statements()
            .iter()
            .try_for_each(|statement| {
                transaction
                    .execute(statement, [])
                    .context("Failed to initialize schema")
                    .map(|_| ())
            })?;
        write_meta_value(&transaction, "version", CURRENT_VERSION)?;
        write_meta_value(&transaction, "last_compatible_version", COMPATIBLE_VERSION)?;

        transaction.commit().context("Failed to commit schema")?;
        info!(version = CURRENT_VERSION, "Created history database");
        Ok(())
    }

    pub fn version(&self) -> Result<i64> {
        Ok(self.meta_value("version")?.unwrap_or(1))
    }

    pub fn compatible_version(&self) -> Result<i64> {
        let version = self.version()?;
        Ok(self
            .meta_value("last_compatible_version")?
            .unwrap_or(version))
    }

    fn meta_value(&self, key: &str) -> Result<Option<i64>> {
        if !self.table_exists("meta")? {
            return Ok(None);
        }

        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read meta value {key}"))?;

        value
            .map(|value| {
                value
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("Invalid meta value for {key}: {value}"))
            })
            .transpose()
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .with_context(|| format!("Failed to look up table {table}"))?;
    Ok(count > 0)
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut statement = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("Failed to inspect table {table}"))?;
    let columns = statement
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read columns of {table}"))?;
    Ok(columns.iter().any(|name| name == column))
}

pub(crate) fn write_meta_value(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )
    .with_context(|| format!("Failed to write meta value {key}"))?;
    Ok(())
}

/// Smallest string greater than every string starting with `prefix`, or `None`
/// when no such bound exists.
pub(crate) fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            char::MAX => None,
            other => char::from_u32(u32::from(other) + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, TimeZone};

    #[test]
    fn db_time_uses_windows_epoch() {
        let unix_epoch = Utc.timestamp_opt(0, 0).single().expect("epoch");
        assert_eq!(to_db_time(unix_epoch), 11_644_473_600_000_000);
        assert_eq!(from_db_time(0), Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap());

        let now = Utc::now().trunc_subsecs(6);
        assert_eq!(from_db_time(to_db_time(now)), now);
    }

    #[test]
    fn fresh_database_is_created_at_current_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("History");
        let database = Database::open(&path).expect("open database");

        assert_eq!(database.version().expect("version"), CURRENT_VERSION);
        assert_eq!(
            database.compatible_version().expect("compatible version"),
            COMPATIBLE_VERSION
        );
        assert!(table_exists(&database.conn, "top_sites").expect("lookup"));
        assert!(column_exists(&database.conn, "downloads", "transient").expect("lookup"));
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        {
            let database = Database::open(&path).expect("open database");
            database
                .add_url(&UrlRow::new("https://example.com/"))
                .expect("add url");
        }

        let database = Database::open(&path).expect("reopen database");
        assert!(
            database
                .get_row_for_url("https://example.com/")
                .expect("lookup")
                .is_some()
        );
    }

    #[test]
    fn too_new_database_is_refused_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE meta (key LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY, value LONGVARCHAR);
                 INSERT INTO meta (key, value) VALUES ('version', '99');
                 INSERT INTO meta (key, value) VALUES ('last_compatible_version', '99');
                 CREATE TABLE urls (id INTEGER PRIMARY KEY, url LONGVARCHAR);",
            )
            .expect("seed");
        }
        let before = fs::read(&path).expect("read before");

        let error = match Database::open(&path) {
            Ok(_) => panic!("too-new database opened"),
            Err(error) => error,
        };
        assert!(matches!(
            error.downcast_ref::<HistoryDbError>(),
            Some(HistoryDbError::TooNew {
                version: 99,
                compatible_version: 99,
                ..
            })
        ));
        assert_eq!(fs::read(&path).expect("read after"), before);
    }

    #[test]
    fn newer_but_compatible_database_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        {
            let database = Database::open(&path).expect("open database");
            write_meta_value(&database.conn, "version", CURRENT_VERSION + 1).expect("bump");
        }

        let database = Database::open(&path).expect("reopen database");
        assert_eq!(database.version().expect("version"), CURRENT_VERSION + 1);
        assert_eq!(
            database.compatible_version().expect("compatible version"),
            COMPATIBLE_VERSION
        );
    }

    #[test]
    fn prefix_upper_bound_increments_last_char() {
        assert_eq!(prefix_upper_bound("foo").as_deref(), Some("fop"));
        assert_eq!(prefix_upper_bound("a\u{D7FF}").as_deref(), Some("a\u{E000}"));
        assert_eq!(
            prefix_upper_bound(&format!("ab{}", char::MAX)).as_deref(),
            Some("ac")
        );
        assert_eq!(prefix_upper_bound(""), None);
    }
}
