use super::{COMPATIBLE_VERSION, HistoryDbError, column_exists, queries, table_exists, write_meta_value};
use crate::search_terms::normalize_term;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::{info, warn};

/// One forward-only schema step. `apply` runs inside the same transaction
/// that records `version`, so a failed step leaves the previous version on
/// disk.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

// Version 1 is the baseline layout and has no step of its own.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "rebuild urls without starred_id",
        apply: recreate_urls_table,
    },
    Migration {
        version: 3,
        description: "replace lower_term with normalized_term",
        apply: normalize_keyword_search_terms,
    },
    Migration {
        version: 4,
        description: "move download urls into downloads_url_chains",
        apply: split_download_url_chains,
    },
    Migration {
        version: 5,
        description: "add downloads_slices and mime_type",
        apply: add_download_slices,
    },
    Migration {
        version: 6,
        description: "add last_access_time and transient to downloads",
        apply: add_download_access_columns,
    },
    Migration {
        version: 7,
        description: "add top_sites",
        apply: add_top_sites_table,
    },
];

pub fn run(conn: &mut Connection, from_version: i64) -> Result<()> {
    for migration in MIGRATIONS.iter().filter(|m| m.version > from_version) {
        apply_migration(conn, migration).map_err(|error| {
            warn!(
                version = migration.version,
                error = %error,
                "History database migration failed"
            );
            HistoryDbError::Migration {
                version: migration.version,
                reason: format!("{error:#}"),
            }
        })?;

        info!(
            version = migration.version,
            description = migration.description,
            "Migrated history database"
        );
    }

    Ok(())
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let transaction = conn
        .transaction()
        .context("Failed to start migration transaction")?;

    transaction
        .execute(queries::CREATE_META, [])
        .context("Failed to create meta table")?;
    (migration.apply)(&transaction)?;
    write_meta_value(&transaction, "version", migration.version)?;
    write_meta_value(
        &transaction,
        "last_compatible_version",
        migration.version.min(COMPATIBLE_VERSION),
    )?;

    transaction
        .commit()
        .context("Failed to commit migration")?;
    Ok(())
}

fn recreate_urls_table(conn: &Connection) -> Result<()> {
    conn.execute(queries::CREATE_TEMP_URLS, [])
        .context("Failed to create temp_urls")?;
    conn.execute(
        "INSERT INTO temp_urls (id, url, title, visit_count, typed_count, last_visit_time, hidden)
         SELECT id, url, title, visit_count, typed_count, last_visit_time, hidden FROM urls",
        [],
    )
    .context("Failed to copy urls into temp_urls")?;
    conn.execute("DROP TABLE urls", [])
        .context("Failed to drop old urls")?;
    conn.execute("ALTER TABLE temp_urls RENAME TO urls", [])
        .context("Failed to rename temp_urls")?;
    conn.execute(queries::INDEX_URLS_URL, [])
        .context("Failed to index urls")?;
    Ok(())
}

fn normalize_keyword_search_terms(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "keyword_search_terms", "lower_term")? {
        conn.execute(queries::CREATE_KEYWORD_SEARCH_TERMS, [])
            .context("Failed to create keyword_search_terms")?;
        return create_keyword_search_terms_indices(conn);
    }

    let rows = {
        let mut statement = conn
            .prepare("SELECT keyword_id, url_id, term, lower_term FROM keyword_search_terms")?;
        statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read legacy keyword search terms")?
    };

    conn.execute_batch(
        "DROP INDEX IF EXISTS keyword_search_terms_index1;
         DROP INDEX IF EXISTS keyword_search_terms_index2;
         DROP INDEX IF EXISTS keyword_search_terms_index3;
         DROP TABLE keyword_search_terms;",
    )
    .context("Failed to drop legacy keyword_search_terms")?;
    conn.execute(queries::CREATE_KEYWORD_SEARCH_TERMS, [])
        .context("Failed to create keyword_search_terms")?;

    {
        let mut insert = conn.prepare(
            "INSERT INTO keyword_search_terms (keyword_id, url_id, term, normalized_term)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (keyword_id, url_id, term, lower_term) in &rows {
            insert
                .execute(params![keyword_id, url_id, term, normalize_term(lower_term)])
                .context("Failed to copy keyword search term")?;
        }
    }

    create_keyword_search_terms_indices(conn)
}

fn create_keyword_search_terms_indices(conn: &Connection) -> Result<()> {
    queries::keyword_search_terms_indices()
        .iter()
        .try_for_each(|statement| {
            conn.execute(statement, [])
                .context("Failed to index keyword_search_terms")
                .map(|_| ())
        })
}

const CREATE_DOWNLOADS_V4: &str = r#"
CREATE TABLE downloads (
  id             INTEGER PRIMARY KEY,
  guid           VARCHAR NOT NULL,
  current_path   LONGVARCHAR NOT NULL,
  target_path    LONGVARCHAR NOT NULL,
  start_time     INTEGER NOT NULL,
  received_bytes INTEGER NOT NULL,
  total_bytes    INTEGER NOT NULL,
  state          INTEGER NOT NULL,
  end_time       INTEGER NOT NULL,
  opened         INTEGER NOT NULL
);
"#;

fn split_download_url_chains(conn: &Connection) -> Result<()> {
    conn.execute(queries::CREATE_DOWNLOADS_URL_CHAINS, [])
        .context("Failed to create downloads_url_chains")?;

    if !table_exists(conn, "downloads")? {
        conn.execute(CREATE_DOWNLOADS_V4, [])
            .context("Failed to create downloads")?;
        return Ok(());
    }
    if !column_exists(conn, "downloads", "full_path")? {
        return Ok(());
    }

    conn.execute("ALTER TABLE downloads RENAME TO downloads_tmp", [])
        .context("Failed to rename legacy downloads")?;
    conn.execute(CREATE_DOWNLOADS_V4, [])
        .context("Failed to create downloads")?;
    conn.execute(
        "INSERT INTO downloads (id, guid, current_path, target_path, start_time,
                                received_bytes, total_bytes, state, end_time, opened)
         SELECT id, lower(hex(randomblob(16))), full_path, full_path, start_time,
                received_bytes, total_bytes, state, end_time, opened
         FROM downloads_tmp",
        [],
    )
    .context("Failed to copy legacy downloads")?;
    conn.execute(
        "INSERT INTO downloads_url_chains (id, chain_index, url)
         SELECT id, 0, url FROM downloads_tmp",
        [],
    )
    .context("Failed to copy legacy download urls")?;
    conn.execute("DROP TABLE downloads_tmp", [])
        .context("Failed to drop legacy downloads")?;
    Ok(())
}

fn add_download_slices(conn: &Connection) -> Result<()> {
    conn.execute(queries::CREATE_DOWNLOADS_SLICES, [])
        .context("Failed to create downloads_slices")?;
    add_column_if_missing(
        conn,
        "downloads",
        "mime_type",
        "VARCHAR(255) NOT NULL DEFAULT ''",
    )
}

fn add_download_access_columns(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "downloads",
        "last_access_time",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    add_column_if_missing(conn, "downloads", "transient", "INTEGER NOT NULL DEFAULT 0")
}

fn add_top_sites_table(conn: &Connection) -> Result<()> {
    conn.execute(queries::CREATE_TOP_SITES, [])
        .context("Failed to create top_sites")?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
        [],
    )
    .with_context(|| format!("Failed to add {table}.{column}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::db::downloads::DownloadState;
    use crate::db::{COMPATIBLE_VERSION, CURRENT_VERSION};

    const VERSION_1_SCHEMA: &str = r#"
        CREATE TABLE meta (key LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY, value LONGVARCHAR);
        INSERT INTO meta (key, value) VALUES ('version', '1');
        INSERT INTO meta (key, value) VALUES ('last_compatible_version', '1');
        CREATE TABLE urls (
          id INTEGER PRIMARY KEY,
          url LONGVARCHAR,
          title LONGVARCHAR,
          visit_count INTEGER DEFAULT 0 NOT NULL,
          typed_count INTEGER DEFAULT 0 NOT NULL,
          last_visit_time INTEGER NOT NULL,
          hidden INTEGER DEFAULT 0 NOT NULL,
          starred_id INTEGER DEFAULT 0 NOT NULL
        );
        CREATE TABLE keyword_search_terms (
          keyword_id INTEGER NOT NULL,
          url_id INTEGER NOT NULL,
          lower_term LONGVARCHAR NOT NULL,
          term LONGVARCHAR NOT NULL
        );
        CREATE INDEX keyword_search_terms_index1 ON keyword_search_terms (keyword_id, lower_term);
        CREATE TABLE downloads (
          id INTEGER PRIMARY KEY,
          full_path LONGVARCHAR NOT NULL,
          url LONGVARCHAR NOT NULL,
          start_time INTEGER NOT NULL,
          received_bytes INTEGER NOT NULL,
          total_bytes INTEGER NOT NULL,
          state INTEGER NOT NULL,
          end_time INTEGER NOT NULL DEFAULT 0,
          opened INTEGER NOT NULL DEFAULT 0
        );
    "#;

    fn seed(path: &std::path::Path, sql: &str) {
        let conn = Connection::open(path).expect("open raw");
        conn.execute_batch(sql).expect("seed");
    }

    fn meta_version(path: &std::path::Path) -> String {
        let conn = Connection::open(path).expect("open raw");
        conn.query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
            row.get(0)
        })
        .expect("version")
    }

    #[test]
    fn steps_are_ordered_and_end_at_current_version() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(versions.last().copied(), Some(CURRENT_VERSION));
    }

    #[test]
    fn version_1_database_migrates_and_keeps_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        seed(
            &path,
            &format!(
                "{VERSION_1_SCHEMA}
                 INSERT INTO urls VALUES (1, 'https://example.com/', 'Example', 3, 1, 13300000000000000, 0, 5);
                 INSERT INTO keyword_search_terms VALUES (2, 1, 'foo   bar', 'Foo   Bar');
                 INSERT INTO downloads VALUES (1, '/tmp/file.zip', 'https://example.com/file.zip',
                                               13300000000000000, 10, 10, 1, 13300000000000001, 0);"
            ),
        );

        let database = Database::open(&path).expect("open migrated database");
        assert_eq!(database.version().expect("version"), CURRENT_VERSION);
        assert_eq!(
            database.compatible_version().expect("compatible version"),
            COMPATIBLE_VERSION
        );

        let row = database
            .get_row_for_url("https://example.com/")
            .expect("lookup")
            .expect("url survives migration");
        assert_eq!(row.id, 1);
        assert_eq!(row.title, "Example");
        assert_eq!(row.visit_count, 3);
        assert_eq!(row.typed_count, 1);

        let term = database
            .get_keyword_search_term_row(1)
            .expect("lookup")
            .expect("term survives migration");
        assert_eq!(term.keyword_id, 2);
        assert_eq!(term.term, "Foo   Bar");
        assert_eq!(term.normalized_term, "foo bar");

        let downloads = database.query_downloads().expect("downloads");
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].url_chain, vec!["https://example.com/file.zip"]);
        assert_eq!(downloads[0].current_path, "/tmp/file.zip");
        assert_eq!(downloads[0].target_path, "/tmp/file.zip");
        assert_eq!(downloads[0].state, DownloadState::Complete);
        assert!(!downloads[0].guid.is_empty());
    }

    #[test]
    fn migrated_urls_table_autoincrements() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        seed(
            &path,
            &format!(
                "{VERSION_1_SCHEMA}
                 INSERT INTO urls VALUES (5, 'https://gone.example/', '', 1, 0, 13300000000000000, 0, 0);"
            ),
        );

        let database = Database::open(&path).expect("open migrated database");
        let gone = database
            .get_row_for_url("https://gone.example/")
            .expect("lookup")
            .expect("row");
        assert!(database.delete_url_row(gone.id).expect("delete"));

        let id = database
            .add_url(&crate::db::UrlRow::new("https://new.example/"))
            .expect("add");
        assert!(id > 5, "ids are never reused, got {id}");
    }

    #[test]
    fn failed_step_leaves_previous_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        // A version 3 file whose downloads table lost its url column.
        seed(
            &path,
            r#"
            CREATE TABLE meta (key LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY, value LONGVARCHAR);
            INSERT INTO meta (key, value) VALUES ('version', '3');
            INSERT INTO meta (key, value) VALUES ('last_compatible_version', '3');
            CREATE TABLE urls (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url LONGVARCHAR,
              title LONGVARCHAR,
              visit_count INTEGER DEFAULT 0 NOT NULL,
              typed_count INTEGER DEFAULT 0 NOT NULL,
              last_visit_time INTEGER NOT NULL,
              hidden INTEGER DEFAULT 0 NOT NULL
            );
            CREATE TABLE keyword_search_terms (
              keyword_id INTEGER NOT NULL,
              url_id INTEGER NOT NULL,
              term LONGVARCHAR NOT NULL,
              normalized_term LONGVARCHAR NOT NULL
            );
            CREATE TABLE downloads (
              id INTEGER PRIMARY KEY,
              full_path LONGVARCHAR NOT NULL,
              start_time INTEGER NOT NULL,
              received_bytes INTEGER NOT NULL,
              total_bytes INTEGER NOT NULL,
              state INTEGER NOT NULL,
              end_time INTEGER NOT NULL,
              opened INTEGER NOT NULL
            );
            "#,
        );

        let error = match Database::open(&path) {
            Ok(_) => panic!("broken migration succeeded"),
            Err(error) => error,
        };
        assert!(matches!(
            error.downcast_ref::<HistoryDbError>(),
            Some(HistoryDbError::Migration { version: 4, .. })
        ));

        assert_eq!(meta_version(&path), "3");
        let conn = Connection::open(&path).expect("open raw");
        assert!(column_exists(&conn, "downloads", "full_path").expect("lookup"));
        assert!(!table_exists(&conn, "downloads_url_chains").expect("lookup"));
    }
}
