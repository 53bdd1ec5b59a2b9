use crate::search_terms::aggregate::MostRepeatedOptions;
use crate::top_sites::search_provider::SearchProvider;
use anyhow::{Context, Result, anyhow, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = ".history-ranker";
const CONFIG_FILE: &str = "config.json";
const BLOCK_LIST_FILE: &str = "blocked_urls.json";
const DEFAULT_REFRESH_MINUTES: u64 = 60;
const DEFAULT_DAYS_BACK: i64 = 90;

/// Feature flags for mixing repeated search queries into top sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatableQueriesConfig {
    pub enabled: bool,
    pub max_queries: usize,
    pub rescale_scores: bool,
    /// Queries win score ties against sites when set.
    pub privilege_queries: bool,
    pub ignore_duplicate_visits: bool,
    pub min_visit_count: i32,
    pub max_age_days: i64,
}

impl Default for RepeatableQueriesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queries: 4,
            rescale_scores: true,
            privilege_queries: false,
            ignore_duplicate_visits: false,
            min_visit_count: 1,
            max_age_days: 90,
        }
    }
}

impl RepeatableQueriesConfig {
    pub fn most_repeated_options(&self) -> MostRepeatedOptions {
        MostRepeatedOptions {
            ignore_duplicate_visits: self.ignore_duplicate_visits,
            min_visit_count: self.min_visit_count,
            max_age_days: self.max_age_days,
        }
    }
}

/// A fixed page offered when history has too few sites to fill the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepopulatedPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub block_list_path: PathBuf,
    pub refresh_minutes: u64,
    pub most_visited_days_back: i64,
    pub chrome_profiles: Vec<String>,
    pub search_provider: Option<SearchProvider>,
    pub repeatable_queries: RepeatableQueriesConfig,
    pub prepopulated_pages: Vec<PrepopulatedPage>,
}

impl Default for Config {
    fn default() -> Self {
        let root = default_root_dir();

        Self {
            db_path: root.join("db").join("History"),
            block_list_path: root.join(BLOCK_LIST_FILE),
            refresh_minutes: DEFAULT_REFRESH_MINUTES,
            most_visited_days_back: DEFAULT_DAYS_BACK,
            chrome_profiles: vec!["Default".to_string()],
            search_provider: Some(SearchProvider::default()),
            repeatable_queries: RepeatableQueriesConfig::default(),
            prepopulated_pages: Vec::new(),
        }
    }
}

impl Config {
    pub fn root_dir() -> Result<PathBuf> {
        Ok(default_root_dir())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(default_root_dir().join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    /// Loads the config, writing the defaults first when none exists yet.
    pub fn load_or_init() -> Result<Self> {
        if Self::config_path()?.exists() {
            return Self::load();
        }

        let config = Self::default();
        config.save()?;
        config.ensure_bootstrap_files()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
        set_mode_600(&config_path)?;

        Ok(())
    }

    pub fn ensure_bootstrap_files(&self) -> Result<()> {
        let root = Self::root_dir()?;
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create root directory: {}", root.display()))?;

        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        if !self.block_list_path.exists() {
            if let Some(parent) = self.block_list_path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create block list directory: {}", parent.display())
                })?;
            }
            fs::write(&self.block_list_path, "{}").with_context(|| {
                format!(
                    "Failed to create block list file: {}",
                    self.block_list_path.display()
                )
            })?;
            set_mode_600(&self.block_list_path)?;
        }

        Ok(())
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_minutes.max(1) * 60)
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match normalize_config_key(key) {
            "db_path" => {
                self.db_path = expand_home(value);
            }
            "block_list_path" => {
                self.block_list_path = expand_home(value);
            }
            "refresh_minutes" => {
                let minutes = value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("refresh_minutes must be a number"))?;
                if minutes == 0 {
                    bail!("refresh_minutes must be at least 1");
                }
                self.refresh_minutes = minutes;
            }
            "most_visited_days_back" => {
                self.most_visited_days_back = parse_positive_days(value, "most_visited_days_back")?;
            }
            "chrome_profiles" => {
                let profiles = value
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>();

                if profiles.is_empty() {
                    bail!("chrome_profiles requires at least one profile");
                }
                self.chrome_profiles = profiles;
            }
            "search_keyword_id" => {
                let keyword_id = value
                    .parse::<i64>()
                    .map_err(|_| anyhow!("search.keyword_id must be a number"))?;
                if keyword_id == 0 {
                    self.search_provider = None;
                } else {
                    self.search_provider_mut().keyword_id = keyword_id;
                }
            }
            "search_name" => {
                self.search_provider_mut().name = value.trim().to_string();
            }
            "search_url_template" => {
                let template = value.trim();
                SearchProvider::validate_template(template)?;
                self.search_provider_mut().url_template = template.to_string();
            }
            "queries_enabled" => {
                self.repeatable_queries.enabled = parse_bool(value, "queries.enabled")?;
            }
            "queries_max" => {
                self.repeatable_queries.max_queries = value
                    .parse::<usize>()
                    .map_err(|_| anyhow!("queries.max must be a number"))?;
            }
            "queries_rescale" => {
                self.repeatable_queries.rescale_scores = parse_bool(value, "queries.rescale")?;
            }
            "queries_privileged" => {
                self.repeatable_queries.privilege_queries = parse_bool(value, "queries.privileged")?;
            }
            "queries_ignore_duplicates" => {
                self.repeatable_queries.ignore_duplicate_visits =
                    parse_bool(value, "queries.ignore_duplicates")?;
            }
            "queries_min_visits" => {
                self.repeatable_queries.min_visit_count = value
                    .parse::<i32>()
                    .map_err(|_| anyhow!("queries.min_visits must be a number"))?
                    .max(1);
            }
            "queries_max_age_days" => {
                self.repeatable_queries.max_age_days =
                    parse_positive_days(value, "queries.max_age_days")?;
            }
            "prepopulated_urls" => {
                let mut pages = Vec::new();
                for raw in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
                    url::Url::parse(raw)
                        .with_context(|| format!("top_sites.prepopulated has an invalid URL: {raw}"))?;
                    pages.push(PrepopulatedPage {
                        url: raw.to_string(),
                        title: String::new(),
                    });
                }
                self.prepopulated_pages = pages;
            }
            _ => {
                bail!(
                    "Unsupported config key: {key}. Supported keys: db_path|db.path, block_list_path|block_list.path, refresh_minutes|top_sites.refresh_minutes, most_visited_days_back|top_sites.days_back, chrome_profiles|chrome.profiles, search_keyword_id|search.keyword_id, search_name|search.name, search_url_template|search.url_template, queries.enabled, queries.max, queries.rescale, queries.privileged, queries.ignore_duplicates, queries.min_visits, queries.max_age_days, prepopulated_urls|top_sites.prepopulated"
                );
            }
        }

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        let provider = self.search_provider.as_ref();
        match normalize_config_key(key) {
            "db_path" => Some(self.db_path.display().to_string()),
            "block_list_path" => Some(self.block_list_path.display().to_string()),
            "refresh_minutes" => Some(self.refresh_minutes.to_string()),
            "most_visited_days_back" => Some(self.most_visited_days_back.to_string()),
            "chrome_profiles" => Some(self.chrome_profiles.join(",")),
            "search_keyword_id" => Some(provider.map_or(0, |p| p.keyword_id).to_string()),
            "search_name" => provider.map(|p| p.name.clone()),
            "search_url_template" => provider.map(|p| p.url_template.clone()),
            "queries_enabled" => Some(self.repeatable_queries.enabled.to_string()),
            "queries_max" => Some(self.repeatable_queries.max_queries.to_string()),
            "queries_rescale" => Some(self.repeatable_queries.rescale_scores.to_string()),
            "queries_privileged" => Some(self.repeatable_queries.privilege_queries.to_string()),
            "queries_ignore_duplicates" => {
                Some(self.repeatable_queries.ignore_duplicate_visits.to_string())
            }
            "queries_min_visits" => Some(self.repeatable_queries.min_visit_count.to_string()),
            "queries_max_age_days" => Some(self.repeatable_queries.max_age_days.to_string()),
            "prepopulated_urls" => Some(
                self.prepopulated_pages
                    .iter()
                    .map(|page| page.url.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }

    fn search_provider_mut(&mut self) -> &mut SearchProvider {
        self.search_provider.get_or_insert_with(SearchProvider::default)
    }
}

fn normalize_config_key(key: &str) -> &str {
    match key {
        "db_path" | "db.path" => "db_path",
        "block_list_path" | "block_list.path" => "block_list_path",
        "refresh_minutes" | "top_sites.refresh_minutes" => "refresh_minutes",
        "most_visited_days_back" | "top_sites.days_back" => "most_visited_days_back",
        "chrome_profiles" | "chrome.profiles" => "chrome_profiles",
        "search_keyword_id" | "search.keyword_id" => "search_keyword_id",
        "search_name" | "search.name" => "search_name",
        "search_url_template" | "search.url_template" => "search_url_template",
        "queries_enabled" | "queries.enabled" => "queries_enabled",
        "queries_max" | "queries.max" => "queries_max",
        "queries_rescale" | "queries.rescale" => "queries_rescale",
        "queries_privileged" | "queries.privileged" => "queries_privileged",
        "queries_ignore_duplicates" | "queries.ignore_duplicates" => "queries_ignore_duplicates",
        "queries_min_visits" | "queries.min_visits" => "queries_min_visits",
        "queries_max_age_days" | "queries.max_age_days" => "queries_max_age_days",
        "prepopulated_urls" | "top_sites.prepopulated" => "prepopulated_urls",
        _ => key,
    }
}

fn parse_bool(value: &str, key: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|_| anyhow!("{key} must be true/false"))
}

fn parse_positive_days(value: &str, key: &str) -> Result<i64> {
    let days = value
        .parse::<i64>()
        .map_err(|_| anyhow!("{key} must be a number"))?;
    if days <= 0 {
        bail!("{key} must be at least 1 day");
    }
    Ok(days)
}

pub fn expand_home(raw: &str) -> PathBuf {
    raw.strip_prefix("~/")
        .and_then(|stripped| home_dir().map(|home| home.join(stripped)))
        .unwrap_or_else(|| PathBuf::from(raw))
}

fn default_root_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub(crate) fn set_mode_600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set file permissions: {}", path.display()))?;
    }

    Ok(())
}
