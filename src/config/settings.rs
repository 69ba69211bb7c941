use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "config.toml";

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// How long a status check result is trusted before the next check hits the network
    #[serde(default = "default_status_cache_ttl")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_status_check_timeout")]
    pub status_check_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_upload_chunk")]
    pub upload_chunk_bytes: usize,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
}

fn default_status_cache_ttl() -> u64 {
    60
}

fn default_status_check_timeout() -> u64 {
    10
}

fn default_max_concurrent_checks() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    60
}

fn default_upload_chunk() -> usize {
    32 * 1024
}

fn default_progress_interval() -> u64 {
    250
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            status_cache_ttl_secs: default_status_cache_ttl(),
            status_check_timeout_secs: default_status_check_timeout(),
            max_concurrent_checks: default_max_concurrent_checks(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            upload_chunk_bytes: default_upload_chunk(),
            progress_interval_ms: default_progress_interval(),
        }
    }
}

impl TransferSettings {
    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }

    pub fn status_check_timeout(&self) -> Duration {
        Duration::from_secs(self.status_check_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Extra headroom demanded on top of a download's size, as a fraction (0.2 = 20%)
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer_percent: f64,
    /// Override for where downloaded ROMs live; defaults to `<data dir>/ROMs`
    #[serde(default)]
    pub roms_dir: Option<PathBuf>,
}

fn default_safety_buffer() -> f64 {
    0.2
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            safety_buffer_percent: default_safety_buffer(),
            roms_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    crate::logging::DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl AppSettings {
    /// Read `config.toml`, writing the defaults on first run
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let path = config_dir.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = Self::default();
                defaults.save(config_dir)?;
                tracing::info!("Wrote default settings to {}", path.display());
                Ok(defaults)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        let content = toml::to_string_pretty(self)?;
        super::write_atomic(&config_dir.join(SETTINGS_FILE), content.as_bytes())
    }

    /// Directory holding downloaded ROMs
    pub fn roms_dir(&self, data_dir: &Path) -> PathBuf {
        self.storage
            .roms_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("ROMs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path()).unwrap();
        assert_eq!(settings.transfer.status_cache_ttl_secs, 60);
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[transfer]\nstatus_check_timeout_secs = 3\n",
        )
        .unwrap();

        let settings = AppSettings::load(dir.path()).unwrap();
        assert_eq!(settings.transfer.status_check_timeout(), Duration::from_secs(3));
        assert_eq!(settings.transfer.max_concurrent_checks, 4);
        assert_eq!(settings.storage.safety_buffer_percent, 0.2);
        assert_eq!(settings.roms_dir(Path::new("/data")), PathBuf::from("/data/ROMs"));
    }
}
