//! Moving ROMs onto devices, and the bookkeeping around it.
//!
//! Uploads go through [`ConnectionManager`] so they share its status cache;
//! every finished transfer lands in the history store. Local downloads are
//! recorded against the ledger and the local device.

use crate::config::{Connection, DeviceType};
use crate::error::{AppError, AppResult};
use crate::history::{TransferDirection, TransferHistoryEntry, TransferHistoryStore};
use crate::local::{DownloadedRom, LocalDevice, LocalDeviceManager, LocalLedger};
use crate::manager::ConnectionManager;
use crate::sftp::{TransferControl, TransferProgress, UploadOutcome};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// A ROM file to send to a remote device
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub rom_id: i64,
    pub rom_name: String,
    pub platform_name: String,
    pub platform_slug: Option<String>,
    pub local_path: PathBuf,
    /// Absolute remote directory
    pub remote_dir: String,
    /// Defaults to the local file name
    pub file_name: Option<String>,
}

impl UploadRequest {
    pub fn remote_path(&self) -> AppResult<String> {
        let file_name = match &self.file_name {
            Some(name) => name.clone(),
            None => self
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| AppError::LocalFile(format!("{} has no file name", self.local_path.display())))?,
        };
        join_remote(&self.remote_dir, &file_name)
    }
}

/// Join an absolute remote directory and a bare file name
pub fn join_remote(dir: &str, file_name: &str) -> AppResult<String> {
    let dir = dir.trim();
    if !dir.starts_with('/') {
        return Err(AppError::InvalidPath(dir.to_string()));
    }
    if file_name.is_empty() || file_name.contains('/') || file_name == "." || file_name == ".." {
        return Err(AppError::InvalidPath(file_name.to_string()));
    }
    Ok(format!("{}/{}", dir.trim_end_matches('/'), file_name))
}

pub struct DeviceTransfers {
    manager: ConnectionManager,
    history: Arc<TransferHistoryStore>,
    local_device: Arc<LocalDeviceManager>,
    ledger: Arc<LocalLedger>,
    safety_buffer_percent: f64,
}

impl DeviceTransfers {
    pub fn new(
        manager: ConnectionManager,
        history: Arc<TransferHistoryStore>,
        local_device: Arc<LocalDeviceManager>,
        ledger: Arc<LocalLedger>,
        safety_buffer_percent: f64,
    ) -> Self {
        Self {
            manager,
            history,
            local_device,
            ledger,
            safety_buffer_percent,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn history(&self) -> &Arc<TransferHistoryStore> {
        &self.history
    }

    pub fn local_device(&self) -> &Arc<LocalDeviceManager> {
        &self.local_device
    }

    pub fn ledger(&self) -> &Arc<LocalLedger> {
        &self.ledger
    }

    /// Upload a ROM and record the result. Cancelled uploads leave no history.
    pub async fn upload_rom<P>(
        &self,
        request: &UploadRequest,
        connection: &Connection,
        control: &TransferControl,
        on_progress: P,
    ) -> AppResult<UploadOutcome>
    where
        P: FnMut(TransferProgress) + Send + 'static,
    {
        let remote_path = request.remote_path()?;
        let file_size = tokio::fs::metadata(&request.local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let result = self
            .manager
            .upload_file(&request.local_path, &remote_path, connection, control, on_progress)
            .await;

        let success = match &result {
            Ok(UploadOutcome::Completed { .. }) => true,
            Ok(UploadOutcome::Cancelled { .. }) => return result,
            Err(_) => false,
        };

        let entry = TransferHistoryEntry {
            id: Uuid::new_v4(),
            device_id: connection.id,
            device_name: connection.name.clone(),
            device_type: DeviceType::Sftp,
            direction: TransferDirection::Upload,
            rom_id: request.rom_id,
            rom_name: request.rom_name.clone(),
            platform_name: request.platform_name.clone(),
            platform_slug: request.platform_slug.clone(),
            file_size_bytes: file_size,
            transferred_at: Utc::now(),
            success,
        };
        if let Err(e) = self.history.save_transfer(entry) {
            tracing::warn!("Failed to record upload of ROM {}: {}", request.rom_id, e);
        }

        result
    }

    /// Fail fast when a download of `required_bytes` would not fit locally
    pub fn check_download_space(&self, required_bytes: u64) -> AppResult<()> {
        self.local_device.ensure_storage(required_bytes, self.safety_buffer_percent)
    }

    /// Record a ROM whose files are already in place under the ROMs directory
    pub fn record_local_download(&self, rom: &DownloadedRom) -> AppResult<()> {
        self.ledger.verify_files(rom)?;
        self.ledger.save_downloaded(rom)?;

        let device = self.local_device.mark_connected()?;
        self.history.save_transfer(TransferHistoryEntry {
            id: Uuid::new_v4(),
            device_id: device.id,
            device_name: device.name,
            device_type: DeviceType::Local,
            direction: TransferDirection::Download,
            rom_id: rom.rom_id,
            rom_name: rom.rom_name.clone(),
            platform_name: rom.platform_name.clone(),
            platform_slug: rom.platform_slug.clone(),
            file_size_bytes: rom.total_size_bytes(),
            transferred_at: Utc::now(),
            success: true,
        })?;

        tracing::info!("Recorded local download of ROM {} ({})", rom.rom_id, rom.rom_name);
        Ok(())
    }

    /// Delete a local ROM and return the device with refreshed capacity
    pub fn delete_local_rom(&self, rom: &DownloadedRom) -> AppResult<LocalDevice> {
        self.ledger.delete_downloaded(rom)?;
        self.local_device.refresh_storage()
    }
}
