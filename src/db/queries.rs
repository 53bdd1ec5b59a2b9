pub const URL_ROW_FIELDS: &str = "id, url, title, visit_count, typed_count, last_visit_time, hidden";

pub const CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
  key   LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY,
  value LONGVARCHAR
);
"#;

pub const CREATE_URLS: &str = r#"
CREATE TABLE IF NOT EXISTS urls (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  url             LONGVARCHAR,
  title           LONGVARCHAR,
  visit_count     INTEGER DEFAULT 0 NOT NULL,
  typed_count     INTEGER DEFAULT 0 NOT NULL,
  last_visit_time INTEGER NOT NULL,
  hidden          INTEGER DEFAULT 0 NOT NULL
);
"#;

pub const CREATE_TEMP_URLS: &str = r#"
CREATE TABLE temp_urls (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  url             LONGVARCHAR,
  title           LONGVARCHAR,
  visit_count     INTEGER DEFAULT 0 NOT NULL,
  typed_count     INTEGER DEFAULT 0 NOT NULL,
  last_visit_time INTEGER NOT NULL,
  hidden          INTEGER DEFAULT 0 NOT NULL
);
"#;

pub const CREATE_KEYWORD_SEARCH_TERMS: &str = r#"
CREATE TABLE IF NOT EXISTS keyword_search_terms (
  keyword_id      INTEGER NOT NULL,
  url_id          INTEGER NOT NULL,
  term            LONGVARCHAR NOT NULL,
  normalized_term LONGVARCHAR NOT NULL
);
"#;

pub const CREATE_DOWNLOADS: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
  id               INTEGER PRIMARY KEY,
  guid             VARCHAR NOT NULL,
  current_path     LONGVARCHAR NOT NULL,
  target_path      LONGVARCHAR NOT NULL,
  start_time       INTEGER NOT NULL,
  received_bytes   INTEGER NOT NULL,
  total_bytes      INTEGER NOT NULL,
  state            INTEGER NOT NULL,
  end_time         INTEGER NOT NULL,
  opened           INTEGER NOT NULL,
  mime_type        VARCHAR(255) NOT NULL DEFAULT '',
  last_access_time INTEGER NOT NULL DEFAULT 0,
  transient        INTEGER NOT NULL DEFAULT 0
);
"#;

pub const CREATE_DOWNLOADS_URL_CHAINS: &str = r#"
CREATE TABLE IF NOT EXISTS downloads_url_chains (
  id          INTEGER NOT NULL,
  chain_index INTEGER NOT NULL,
  url         LONGVARCHAR NOT NULL,
  PRIMARY KEY (id, chain_index)
);
"#;

pub const CREATE_DOWNLOADS_SLICES: &str = r#"
CREATE TABLE IF NOT EXISTS downloads_slices (
  download_id    INTEGER NOT NULL,
  offset         INTEGER NOT NULL,
  received_bytes INTEGER NOT NULL,
  finished       INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (download_id, offset)
);
"#;

pub const CREATE_TOP_SITES: &str = r#"
CREATE TABLE IF NOT EXISTS top_sites (
  url      LONGVARCHAR NOT NULL PRIMARY KEY,
  url_rank INTEGER NOT NULL,
  title    LONGVARCHAR NOT NULL DEFAULT '',
  score    REAL NOT NULL DEFAULT 0
);
"#;

pub const INDEX_URLS_URL: &str = "CREATE INDEX IF NOT EXISTS urls_url_index ON urls (url);";

// Lookups by keyword and prefix.
pub const INDEX_KEYWORD_SEARCH_TERMS_NORMALIZED: &str = "CREATE INDEX IF NOT EXISTS keyword_search_terms_index1 ON keyword_search_terms (keyword_id, normalized_term);";

// Cascading deletes from urls.
pub const INDEX_KEYWORD_SEARCH_TERMS_URL: &str =
    "CREATE INDEX IF NOT EXISTS keyword_search_terms_index2 ON keyword_search_terms (url_id);";

pub const INDEX_KEYWORD_SEARCH_TERMS_TERM: &str =
    "CREATE INDEX IF NOT EXISTS keyword_search_terms_index3 ON keyword_search_terms (term);";

pub fn keyword_search_terms_indices() -> Vec<&'static str> {
    vec![
        INDEX_KEYWORD_SEARCH_TERMS_NORMALIZED,
        INDEX_KEYWORD_SEARCH_TERMS_URL,
        INDEX_KEYWORD_SEARCH_TERMS_TERM,
    ]
}

/// Statements that build a database at the current schema version.
pub fn schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_META,
        CREATE_URLS,
        INDEX_URLS_URL,
        CREATE_KEYWORD_SEARCH_TERMS,
        CREATE_DOWNLOADS,
        CREATE_DOWNLOADS_URL_CHAINS,
        CREATE_DOWNLOADS_SLICES,
        CREATE_TOP_SITES,
    ];
    statements.extend(keyword_search_terms_indices());
    statements
}
