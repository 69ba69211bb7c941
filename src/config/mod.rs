pub mod connections;
pub mod repository;
pub mod settings;

pub use connections::*;
pub use repository::*;
pub use settings::*;

use crate::error::{AppError, AppResult};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "rombridge";

/// Get the rombridge config directory (settings, connection metadata, fallback secrets)
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| AppError::Config("Could not find config directory".into()))?
        .join(APP_DIR_NAME);

    Ok(config_dir)
}

/// Get the rombridge data directory (transfer history, local device, downloaded ROMs)
pub fn get_data_dir() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .ok_or_else(|| AppError::Config("Could not find data directory".into()))?
        .join(APP_DIR_NAME);

    Ok(data_dir)
}

/// Write through a sibling temp file and rename over the target.
/// The parent directory must already exist.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}
