//! The device this client runs on.
//!
//! One record per install, persisted next to the transfer history. Capacity
//! figures are refreshed from the filesystem that holds the ROMs directory.

use crate::config::{write_atomic, DeviceType};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const DEVICE_FILE: &str = "local_device.json";
const LOW_STORAGE_BYTES: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCapacity {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Source of free/total space for a directory
pub trait StorageProbe: Send + Sync {
    fn capacity(&self, path: &Path) -> AppResult<StorageCapacity>;

    /// (model, system version) reported for a fresh device record
    fn describe(&self) -> (String, String) {
        ("Unknown".into(), "Unknown".into())
    }
}

/// Reads mounted disks through `sysinfo`
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl StorageProbe for SysinfoProbe {
    fn capacity(&self, path: &Path) -> AppResult<StorageCapacity> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let target = nearest_existing(path);

        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| StorageCapacity {
                available_bytes: disk.available_space(),
                total_bytes: disk.total_space(),
            })
            .ok_or_else(|| AppError::LocalFile(format!("No disk found for {}", path.display())))
    }

    fn describe(&self) -> (String, String) {
        let model = sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
        let version = sysinfo::System::long_os_version()
            .or_else(sysinfo::System::os_version)
            .unwrap_or_else(|| "Unknown".into());
        (model, version)
    }
}

/// The ROMs directory may not exist yet; measure the closest ancestor that does
fn nearest_existing(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or(absolute)
}

/// A probe that reports whatever it was last told. Useful for embedders
/// without a real filesystem view, and for tests.
#[derive(Debug, Default)]
pub struct FixedStorage {
    capacity: Mutex<StorageCapacity>,
}

impl FixedStorage {
    pub fn new(available_bytes: u64, total_bytes: u64) -> Self {
        Self {
            capacity: Mutex::new(StorageCapacity {
                available_bytes,
                total_bytes,
            }),
        }
    }

    pub fn set(&self, available_bytes: u64, total_bytes: u64) {
        *self.capacity.lock() = StorageCapacity {
            available_bytes,
            total_bytes,
        };
    }
}

impl StorageProbe for FixedStorage {
    fn capacity(&self, _path: &Path) -> AppResult<StorageCapacity> {
        Ok(*self.capacity.lock())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDevice {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub system_version: String,
    pub available_storage_bytes: u64,
    pub total_storage_bytes: u64,
    #[serde(default = "default_true")]
    pub is_default: bool,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl LocalDevice {
    pub fn new(name: impl Into<String>, model: impl Into<String>, system_version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            model: model.into(),
            system_version: system_version.into(),
            available_storage_bytes: 0,
            total_storage_bytes: 0,
            is_default: true,
            last_connected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::Local
    }

    /// Used space as a percentage of total, 0 when total is unknown
    pub fn storage_usage_percent(&self) -> f64 {
        if self.total_storage_bytes == 0 {
            return 0.0;
        }
        let used = self.total_storage_bytes.saturating_sub(self.available_storage_bytes);
        used as f64 / self.total_storage_bytes as f64 * 100.0
    }

    pub fn has_low_storage(&self) -> bool {
        self.available_storage_bytes < LOW_STORAGE_BYTES
    }

    /// Compare against the last refreshed capacity
    pub fn can_fit(&self, required_bytes: u64, safety_buffer_percent: f64) -> bool {
        self.available_storage_bytes >= required_with_buffer(required_bytes, safety_buffer_percent)
    }
}

const BASIS_POINTS: u128 = 10_000;
const MAX_BUFFER: f64 = 1_000_000.0;

/// `ceil(required * (1 + buffer))` in whole bytes. The buffer is rounded to
/// basis points and the product is taken in integers; negative or non-finite
/// buffers count as zero.
pub fn required_with_buffer(required_bytes: u64, safety_buffer_percent: f64) -> u64 {
    let buffer = if safety_buffer_percent.is_finite() {
        safety_buffer_percent.clamp(0.0, MAX_BUFFER)
    } else {
        0.0
    };
    let bp = (buffer * BASIS_POINTS as f64).round() as u128;
    let required = (required_bytes as u128 * (BASIS_POINTS + bp)).div_ceil(BASIS_POINTS);
    u64::try_from(required).unwrap_or(u64::MAX)
}

pub struct LocalDeviceManager {
    device: RwLock<LocalDevice>,
    file_path: PathBuf,
    roms_dir: PathBuf,
    probe: Arc<dyn StorageProbe>,
}

impl LocalDeviceManager {
    /// Load the device record from `data_dir`, creating one on first run
    pub fn load(data_dir: &Path, roms_dir: PathBuf, probe: Arc<dyn StorageProbe>) -> AppResult<Self> {
        let file_path = data_dir.join(DEVICE_FILE);

        let stored = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            match serde_json::from_str::<LocalDevice>(&content) {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::warn!("Failed to parse local device record, recreating: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let is_new = stored.is_none();
        let device = stored.unwrap_or_else(|| {
            let (model, version) = probe.describe();
            let name = sysinfo::System::host_name().unwrap_or_else(|| "This device".into());
            LocalDevice::new(name, model, version)
        });

        let manager = Self {
            device: RwLock::new(device),
            file_path,
            roms_dir,
            probe,
        };

        if let Err(e) = manager.refresh_storage() {
            tracing::warn!("Could not read storage capacity: {}", e);
            if is_new {
                manager.update(|_| {})?;
            }
        }

        Ok(manager)
    }

    pub fn device(&self) -> LocalDevice {
        self.device.read().clone()
    }

    pub fn roms_dir(&self) -> &Path {
        &self.roms_dir
    }

    /// Re-read capacity for the ROMs directory and persist it
    pub fn refresh_storage(&self) -> AppResult<LocalDevice> {
        let capacity = self.probe.capacity(&self.roms_dir)?;
        self.update(|device| {
            device.available_storage_bytes = capacity.available_bytes;
            device.total_storage_bytes = capacity.total_bytes;
        })
    }

    pub fn rename(&self, name: &str) -> AppResult<LocalDevice> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Device name cannot be empty".into()));
        }
        self.update(|device| device.name = name.to_string())
    }

    pub fn set_default(&self, is_default: bool) -> AppResult<LocalDevice> {
        self.update(|device| device.is_default = is_default)
    }

    pub fn mark_connected(&self) -> AppResult<LocalDevice> {
        self.update(|device| device.last_connected_at = Some(Utc::now()))
    }

    /// Refreshes capacity, then checks `available >= ceil(required * (1 + buffer))`
    pub fn has_enough_storage(&self, required_bytes: u64, safety_buffer_percent: f64) -> AppResult<bool> {
        let device = self.refresh_storage()?;
        Ok(device.can_fit(required_bytes, safety_buffer_percent))
    }

    /// Same check as [`has_enough_storage`](Self::has_enough_storage), as an error
    pub fn ensure_storage(&self, required_bytes: u64, safety_buffer_percent: f64) -> AppResult<()> {
        let device = self.refresh_storage()?;
        if device.can_fit(required_bytes, safety_buffer_percent) {
            return Ok(());
        }

        let required = required_with_buffer(required_bytes, safety_buffer_percent);
        tracing::info!(
            "Not enough local storage: need {} bytes, {} available",
            required,
            device.available_storage_bytes
        );
        Err(AppError::InsufficientStorage {
            required,
            available: device.available_storage_bytes,
        })
    }

    fn update<F>(&self, change: F) -> AppResult<LocalDevice>
    where
        F: FnOnce(&mut LocalDevice),
    {
        let mut device = self.device.write();
        let mut next = device.clone();
        change(&mut next);
        next.updated_at = Utc::now();

        let content = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.file_path, &content)?;

        *device = next.clone();
        Ok(next)
    }
}
