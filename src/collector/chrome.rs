use crate::db::{UrlRow, from_db_time};
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

/// A search term row from a Chrome profile. `url_id` is Chrome's id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromeSearchTerm {
    pub keyword_id: i64,
    pub url_id: i64,
    pub term: String,
}

#[derive(Debug, Default)]
pub struct ChromeHistory {
    pub urls: Vec<UrlRow>,
    pub terms: Vec<ChromeSearchTerm>,
}

pub fn chrome_root() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    if cfg!(target_os = "macos") {
        home.join("Library")
            .join("Application Support")
            .join("Google")
            .join("Chrome")
    } else if cfg!(windows) {
        dirs::data_local_dir()
            .unwrap_or_else(|| home.join("AppData").join("Local"))
            .join("Google")
            .join("Chrome")
            .join("User Data")
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("google-chrome")
    }
}

pub fn profile_history_path(profile: &str) -> PathBuf {
    chrome_root().join(profile).join("History")
}

pub fn detect_chrome_profiles() -> Vec<String> {
    fs::read_dir(chrome_root())
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.is_dir() && path.join("History").exists() {
                path.file_name()
                    .map(|name| name.to_string_lossy().to_string())
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
}

/// Reads a profile's History file through a temporary copy, since Chrome
/// keeps the original locked while running.
pub fn read_profile_history(path: &Path) -> Result<ChromeHistory> {
    let temp_dir = std::env::temp_dir().join(format!(
        "history-ranker-chrome-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis()
    ));

    fs::create_dir_all(&temp_dir).with_context(|| {
        format!(
            "Failed to create Chrome temp directory: {}",
            temp_dir.display()
        )
    })?;

    let temp_db = temp_dir.join("History");
    let result = fs::copy(path, &temp_db)
        .with_context(|| {
            format!(
                "Failed to copy Chrome History DB: {} -> {}",
                path.display(),
                temp_db.display()
            )
        })
        .and_then(|_| read_history(&temp_db));
    let _ = fs::remove_dir_all(&temp_dir);

    result
}

fn read_history(path: &Path) -> Result<ChromeHistory> {
    let conn = Connection::open(path).with_context(|| {
        format!(
            "Failed to open temporary Chrome History DB: {}",
            path.display()
        )
    })?;

    let mut statement = conn
        .prepare(
            "SELECT id, url, COALESCE(title, ''), visit_count, typed_count, last_visit_time, hidden
             FROM urls",
        )
        .context("Failed to prepare Chrome urls query")?;
    let urls = statement
        .query_map([], |row| {
            Ok(UrlRow {
                id: row.get(0)?,
                url: row.get(1)?,
                title: row.get(2)?,
                visit_count: row.get(3)?,
                typed_count: row.get(4)?,
                last_visit: from_db_time(row.get(5)?),
                hidden: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read Chrome urls rows")?;

    let mut statement = conn
        .prepare("SELECT keyword_id, url_id, term FROM keyword_search_terms")
        .context("Failed to prepare Chrome keyword_search_terms query")?;
    let terms = statement
        .query_map([], |row| {
            Ok(ChromeSearchTerm {
                keyword_id: row.get(0)?,
                url_id: row.get(1)?,
                term: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read Chrome keyword_search_terms rows")?;

    Ok(ChromeHistory { urls, terms })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::to_db_time;
    use chrono::{DateTime, Utc};
    use rusqlite::params;

    /// Writes a minimal Chrome History file.
    pub(crate) fn write_chrome_history(
        path: &Path,
        urls: &[(i64, &str, &str, i32, i32, DateTime<Utc>)],
        terms: &[(i64, i64, &str)],
    ) {
        let conn = Connection::open(path).expect("open chrome db");
        conn.execute_batch(
            "CREATE TABLE urls (id INTEGER PRIMARY KEY, url LONGVARCHAR, title LONGVARCHAR,
                 visit_count INTEGER DEFAULT 0 NOT NULL, typed_count INTEGER DEFAULT 0 NOT NULL,
                 last_visit_time INTEGER NOT NULL, hidden INTEGER DEFAULT 0 NOT NULL);
             CREATE TABLE keyword_search_terms (keyword_id INTEGER NOT NULL, url_id INTEGER NOT NULL,
                 term LONGVARCHAR NOT NULL, normalized_term LONGVARCHAR NOT NULL);",
        )
        .expect("create chrome schema");

        for (id, url, title, visits, typed, last_visit) in urls {
            conn.execute(
                "INSERT INTO urls (id, url, title, visit_count, typed_count, last_visit_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, url, title, visits, typed, to_db_time(*last_visit)],
            )
            .expect("insert chrome url");
        }
        for (keyword_id, url_id, term) in terms {
            conn.execute(
                "INSERT INTO keyword_search_terms (keyword_id, url_id, term, normalized_term)
                 VALUES (?1, ?2, ?3, lower(?3))",
                params![keyword_id, url_id, term],
            )
            .expect("insert chrome term");
        }
    }

    #[test]
    fn reads_urls_and_terms_from_a_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("History");
        let visited = Utc::now();
        write_chrome_history(
            &path,
            &[(5, "https://a.example/", "A", 3, 1, visited)],
            &[(2, 5, "Rust Book")],
        );

        let history = read_profile_history(&path).expect("read history");
        assert_eq!(history.urls.len(), 1);
        assert_eq!(history.urls[0].id, 5);
        assert_eq!(history.urls[0].visit_count, 3);
        assert_eq!(
            to_db_time(history.urls[0].last_visit),
            to_db_time(visited)
        );
        assert_eq!(
            history.terms,
            vec![ChromeSearchTerm {
                keyword_id: 2,
                url_id: 5,
                term: "Rust Book".to_string(),
            }]
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_profile_history(&dir.path().join("History")).is_err());
    }
}
