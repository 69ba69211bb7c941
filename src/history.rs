//! Transfer history persistence
//!
//! Entries are append-only: a transfer is recorded once and never edited.
//! Clearing removes entries; grouping by platform is computed on read.

use crate::config::{write_atomic, DeviceType};
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const HISTORY_FILE: &str = "transfer_history.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// One completed or failed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHistoryEntry {
    pub id: Uuid,
    pub device_id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub direction: TransferDirection,
    pub rom_id: i64,
    pub rom_name: String,
    pub platform_name: String,
    #[serde(default)]
    pub platform_slug: Option<String>,
    pub file_size_bytes: u64,
    pub transferred_at: DateTime<Utc>,
    pub success: bool,
}

/// Transfers for one platform, newest first
#[derive(Debug, Clone, Serialize)]
pub struct PlatformTransferGroup {
    pub platform_name: String,
    pub platform_slug: Option<String>,
    pub transfers: Vec<TransferHistoryEntry>,
    pub transfer_count: usize,
    pub total_size_bytes: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct HistoryFile {
    #[serde(default)]
    entries: Vec<TransferHistoryEntry>,
}

/// File-backed transfer history
pub struct TransferHistoryStore {
    entries: RwLock<Vec<TransferHistoryEntry>>,
    file_path: PathBuf,
}

impl TransferHistoryStore {
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let file_path = data_dir.join(HISTORY_FILE);
        let entries = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            match serde_json::from_str::<HistoryFile>(&content) {
                Ok(file) => file.entries,
                Err(e) => {
                    tracing::warn!("Failed to parse transfer history, starting fresh: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            file_path,
        })
    }

    /// Append an entry
    pub fn save_transfer(&self, entry: TransferHistoryEntry) -> AppResult<()> {
        self.update(|entries| entries.push(entry))
    }

    /// All entries, newest first
    pub fn get_all_transfers(&self) -> Vec<TransferHistoryEntry> {
        newest_first(self.entries.read().clone())
    }

    pub fn get_transfers_for_device(&self, device_id: Uuid) -> Vec<TransferHistoryEntry> {
        newest_first(
            self.entries
                .read()
                .iter()
                .filter(|e| e.device_id == device_id)
                .cloned()
                .collect(),
        )
    }

    pub fn get_transfers_grouped_by_platform(&self) -> Vec<PlatformTransferGroup> {
        group_by_platform(self.get_all_transfers())
    }

    pub fn get_transfers_grouped_by_platform_for_device(&self, device_id: Uuid) -> Vec<PlatformTransferGroup> {
        group_by_platform(self.get_transfers_for_device(device_id))
    }

    pub fn clear_all_history(&self) -> AppResult<()> {
        self.update(|entries| entries.clear())?;
        tracing::info!("Cleared transfer history");
        Ok(())
    }

    pub fn clear_history_for_device(&self, device_id: Uuid) -> AppResult<()> {
        self.update(|entries| entries.retain(|e| e.device_id != device_id))
    }

    pub fn total_transfer_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn total_transfer_size(&self) -> u64 {
        self.entries.read().iter().map(|e| e.file_size_bytes).sum()
    }

    /// Apply `change` to a copy and swap it in only once it is on disk
    fn update<F>(&self, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut Vec<TransferHistoryEntry>),
    {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        change(&mut next);

        let file = HistoryFile { entries: next };
        let content = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.file_path, &content)?;

        *entries = file.entries;
        Ok(())
    }
}

fn newest_first(mut entries: Vec<TransferHistoryEntry>) -> Vec<TransferHistoryEntry> {
    entries.sort_by(|a, b| b.transferred_at.cmp(&a.transferred_at));
    entries
}

/// Bucket by platform name; groups come out sorted by name
fn group_by_platform(entries: Vec<TransferHistoryEntry>) -> Vec<PlatformTransferGroup> {
    let mut buckets: BTreeMap<String, Vec<TransferHistoryEntry>> = BTreeMap::new();
    for entry in entries {
        buckets.entry(entry.platform_name.clone()).or_default().push(entry);
    }

    buckets
        .into_iter()
        .map(|(platform_name, transfers)| {
            let transfers = newest_first(transfers);
            PlatformTransferGroup {
                platform_slug: transfers.iter().find_map(|t| t.platform_slug.clone()),
                transfer_count: transfers.len(),
                total_size_bytes: transfers.iter().map(|t| t.file_size_bytes).sum(),
                platform_name,
                transfers,
            }
        })
        .collect()
}
