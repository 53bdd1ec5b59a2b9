use crate::config::set_mode_600;
use crate::history::types::normalize_url;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// URLs the user removed from top sites, stored as a JSON object keyed by
/// URL hash. Values are an empty marker; presence means blocked.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    path: Option<PathBuf>,
    entries: Map<String, Value>,
}

impl BlockList {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Reads the list at `path`; a missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read block list: {}", path.display()))?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse block list: {}", path.display()))?
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn url_hash(url: &str) -> String {
        blake3::hash(normalize_url(url).as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(&Self::url_hash(url))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `true` when the URL was not blocked before.
    pub fn add(&mut self, url: &str) -> Result<bool> {
        let inserted = self
            .entries
            .insert(Self::url_hash(url), Value::Object(Map::new()))
            .is_none();
        if inserted {
            self.save()?;
        }
        Ok(inserted)
    }

    /// `true` when the URL was blocked before.
    pub fn remove(&mut self, url: &str) -> Result<bool> {
        let removed = self.entries.remove(&Self::url_hash(url)).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create block list directory: {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize block list")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write block list: {}", path.display()))?;
        set_mode_600(path)?;

        debug!(entries = self.entries.len(), path = %path.display(), "Saved block list");
        Ok(())
    }
}
