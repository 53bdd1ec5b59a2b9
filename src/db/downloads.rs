use super::{Database, from_db_time, to_db_time};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    InProgress,
    Complete,
    Cancelled,
    Interrupted,
}

impl DownloadState {
    fn to_db(self) -> i64 {
        match self {
            Self::InProgress => 0,
            Self::Complete => 1,
            Self::Cancelled => 2,
            Self::Interrupted => 4,
        }
    }

    fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::InProgress),
            1 => Some(Self::Complete),
            2 => Some(Self::Cancelled),
            4 => Some(Self::Interrupted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSlice {
    pub download_id: u32,
    pub offset: i64,
    pub received_bytes: i64,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRow {
    pub id: u32,
    pub guid: String,
    pub current_path: String,
    pub target_path: String,
    pub url_chain: Vec<String>,
    pub mime_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub received_bytes: i64,
    pub total_bytes: i64,
    pub state: DownloadState,
    pub opened: bool,
    pub last_access_time: DateTime<Utc>,
    pub transient: bool,
    pub slices: Vec<DownloadSlice>,
}

struct StoredDownload {
    row: DownloadRow,
    raw_state: i64,
}

impl Database {
    /// Inserts a download with its URL chain and slices. Rows without a URL
    /// chain, id or guid are refused with `false`.
    pub fn create_download(&self, download: &DownloadRow) -> Result<bool> {
        self.ensure_in_progress_entries_cleaned()?;

        if download.id == 0 || download.guid.is_empty() || download.url_chain.is_empty() {
            warn!(
                download_id = download.id,
                chain_length = download.url_chain.len(),
                "Refusing incomplete download"
            );
            return Ok(false);
        }

        let inserted = self.conn.execute(
            "INSERT INTO downloads (id, guid, current_path, target_path, start_time, received_bytes,
                                    total_bytes, state, end_time, opened, mime_type,
                                    last_access_time, transient)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                download.id,
                download.guid,
                download.current_path,
                download.target_path,
                to_db_time(download.start_time),
                download.received_bytes,
                download.total_bytes,
                download.state.to_db(),
                to_db_time(download.end_time),
                download.opened,
                download.mime_type,
                to_db_time(download.last_access_time),
                download.transient,
            ],
        );
        if let Err(error) = inserted {
            warn!(download_id = download.id, error = %error, "Failed to insert download");
            return Ok(false);
        }

        // Chain rows can outlive a download removed by an older build.
        self.conn
            .execute(
                "DELETE FROM downloads_url_chains WHERE id = ?1",
                params![download.id],
            )
            .context("Failed to clear stale download URL chain")?;

        for (index, url) in download.url_chain.iter().enumerate() {
            let inserted = self.conn.execute(
                "INSERT INTO downloads_url_chains (id, chain_index, url) VALUES (?1, ?2, ?3)",
                params![download.id, index as i64, url],
            );
            if let Err(error) = inserted {
                warn!(download_id = download.id, error = %error, "Failed to insert download URL");
                self.remove_download(download.id)?;
                return Ok(false);
            }
        }

        for slice in &download.slices {
            self.create_or_update_download_slice(slice)?;
        }

        Ok(true)
    }

    /// Rewrites the mutable columns and then the slices. `false` when the
    /// download does not exist.
    pub fn update_download(&self, download: &DownloadRow) -> Result<bool> {
        self.ensure_in_progress_entries_cleaned()?;

        let changed = self
            .conn
            .execute(
                "UPDATE downloads
                 SET current_path = ?1, target_path = ?2, mime_type = ?3, received_bytes = ?4,
                     total_bytes = ?5, state = ?6, end_time = ?7, opened = ?8,
                     last_access_time = ?9, transient = ?10
                 WHERE id = ?11",
                params![
                    download.current_path,
                    download.target_path,
                    download.mime_type,
                    download.received_bytes,
                    download.total_bytes,
                    download.state.to_db(),
                    to_db_time(download.end_time),
                    download.opened,
                    to_db_time(download.last_access_time),
                    download.transient,
                    download.id,
                ],
            )
            .context("Failed to update download")?;
        if changed == 0 {
            return Ok(false);
        }

        if download.slices.is_empty() {
            self.remove_download_slices(download.id)?;
        } else {
            for slice in &download.slices {
                self.create_or_update_download_slice(slice)?;
            }
        }

        Ok(true)
    }

    pub fn remove_download(&self, id: u32) -> Result<()> {
        self.conn
            .execute("DELETE FROM downloads WHERE id = ?1", params![id])
            .context("Failed to delete download")?;
        self.conn
            .execute(
                "DELETE FROM downloads_url_chains WHERE id = ?1",
                params![id],
            )
            .context("Failed to delete download URL chain")?;
        self.remove_download_slices(id)
    }

    fn remove_download_slices(&self, id: u32) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM downloads_slices WHERE download_id = ?1",
                params![id],
            )
            .context("Failed to delete download slices")?;
        Ok(())
    }

    /// Writes one slice; zero-byte slices are skipped.
    pub fn create_or_update_download_slice(&self, slice: &DownloadSlice) -> Result<bool> {
        if slice.received_bytes == 0 {
            return Ok(false);
        }

        self.conn
            .execute(
                "INSERT OR REPLACE INTO downloads_slices (download_id, offset, received_bytes, finished)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    slice.download_id,
                    slice.offset,
                    slice.received_bytes,
                    slice.finished
                ],
            )
            .context("Failed to write download slice")?;
        Ok(true)
    }

    /// All stored downloads with their chains and slices. Rows that cannot
    /// be represented (no URL chain or an unknown state) are deleted.
    pub fn query_downloads(&self) -> Result<Vec<DownloadRow>> {
        self.ensure_in_progress_entries_cleaned()?;

        let downloads: Vec<StoredDownload> = {
            let mut statement = self.conn.prepare(
                "SELECT id, guid, current_path, target_path, mime_type, start_time, end_time,
                        received_bytes, total_bytes, state, opened, last_access_time, transient
                 FROM downloads ORDER BY start_time, id",
            )?;
            statement
                .query_map([], |row| {
                    let raw_state: i64 = row.get(9)?;
                    Ok(StoredDownload {
                        row: DownloadRow {
                            id: row.get(0)?,
                            guid: row.get(1)?,
                            current_path: row.get(2)?,
                            target_path: row.get(3)?,
                            url_chain: Vec::new(),
                            mime_type: row.get(4)?,
                            start_time: from_db_time(row.get(5)?),
                            end_time: from_db_time(row.get(6)?),
                            received_bytes: row.get(7)?,
                            total_bytes: row.get(8)?,
                            state: DownloadState::from_db(raw_state)
                                .unwrap_or(DownloadState::Interrupted),
                            opened: row.get(10)?,
                            last_access_time: from_db_time(row.get(11)?),
                            transient: row.get(12)?,
                            slices: Vec::new(),
                        },
                        raw_state,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to query downloads")?
        };

        let mut chains: HashMap<u32, Vec<(i64, String)>> = HashMap::new();
        {
            let mut statement = self
                .conn
                .prepare("SELECT id, chain_index, url FROM downloads_url_chains")?;
            let rows = statement
                .query_map([], |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to query download URL chains")?;
            for (id, index, url) in rows {
                chains.entry(id).or_default().push((index, url));
            }
        }

        let mut slices: HashMap<u32, Vec<DownloadSlice>> = HashMap::new();
        {
            let mut statement = self.conn.prepare(
                "SELECT download_id, offset, received_bytes, finished
                 FROM downloads_slices ORDER BY download_id, offset",
            )?;
            let rows = statement
                .query_map([], |row| {
                    Ok(DownloadSlice {
                        download_id: row.get(0)?,
                        offset: row.get(1)?,
                        received_bytes: row.get(2)?,
                        finished: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to query download slices")?;
            for slice in rows {
                slices.entry(slice.download_id).or_default().push(slice);
            }
        }

        let mut results = Vec::with_capacity(downloads.len());
        for mut stored in downloads {
            let id = stored.row.id;
            let chain = chains.remove(&id).unwrap_or_default();
            if chain.is_empty() || DownloadState::from_db(stored.raw_state).is_none() {
                warn!(
                    download_id = id,
                    state = stored.raw_state,
                    "Deleting unreadable download"
                );
                self.remove_download(id)?;
                continue;
            }

            let mut chain = chain;
            chain.sort_by_key(|(index, _)| *index);
            stored.row.url_chain = chain.into_iter().map(|(_, url)| url).collect();
            stored.row.slices = slices.remove(&id).unwrap_or_default();
            results.push(stored.row);
        }

        // Whatever is left belongs to no download.
        for id in slices.into_keys() {
            self.remove_download_slices(id)?;
        }

        Ok(results)
    }

    pub fn get_next_download_id(&self) -> Result<u32> {
        let max: Option<u32> = self
            .conn
            .query_row("SELECT MAX(id) FROM downloads", [], |row| row.get(0))
            .optional()
            .context("Failed to read max download id")?
            .flatten();
        Ok(max.unwrap_or(0) + 1)
    }

    pub fn count_downloads(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM downloads", [], |row| row.get(0))
            .context("Failed to count downloads")
    }

    /// Downloads left in progress by a previous session cannot resume; mark
    /// them interrupted once per open.
    fn ensure_in_progress_entries_cleaned(&self) -> Result<()> {
        if self.download_cleanup_done.get() {
            return Ok(());
        }

        let interrupted = self
            .conn
            .execute(
                "UPDATE downloads SET state = ?1 WHERE state = ?2",
                params![
                    DownloadState::Interrupted.to_db(),
                    DownloadState::InProgress.to_db()
                ],
            )
            .context("Failed to interrupt stale downloads")?;
        if interrupted > 0 {
            info!(interrupted, "Marked stale downloads as interrupted");
        }

        self.download_cleanup_done.set(true);
        Ok(())
    }
}
