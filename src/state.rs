use crate::config::{self, AppSettings, ConnectionRepository};
use crate::error::AppResult;
use crate::history::TransferHistoryStore;
use crate::keychain::{CredentialStore, KeyringSecretStore};
use crate::local::{LocalDeviceManager, LocalLedger, SysinfoProbe};
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::sftp::Ssh2Client;
use crate::transfer::DeviceTransfers;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the client needs, built once at startup
pub struct AppState {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub settings: Arc<RwLock<AppSettings>>,
    pub repository: Arc<ConnectionRepository>,
    pub manager: ConnectionManager,
    pub history: Arc<TransferHistoryStore>,
    pub local_device: Arc<LocalDeviceManager>,
    pub ledger: Arc<LocalLedger>,
    pub transfers: Arc<DeviceTransfers>,
}

impl AppState {
    /// Load from the platform config and data directories
    pub fn load() -> AppResult<Self> {
        let config_dir = config::get_config_dir()?;
        let data_dir = config::get_data_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        std::fs::create_dir_all(&data_dir)?;

        tracing::info!("rombridge config dir: {:?}", config_dir);

        let settings = AppSettings::load(&config_dir)?;

        let secrets = KeyringSecretStore::new(config_dir.clone());
        let status = secrets.keyring_status();
        if let Some(warning) = &status.warning {
            tracing::warn!("{}", warning);
        }
        let repository = Arc::new(ConnectionRepository::load(
            &config_dir,
            CredentialStore::new(Arc::new(secrets)),
        )?);

        let client = Arc::new(Ssh2Client::from_settings(&settings.transfer));
        let manager = ConnectionManager::new(repository.clone(), client, ManagerConfig::from(&settings.transfer));

        let roms_dir = settings.roms_dir(&data_dir);
        std::fs::create_dir_all(&roms_dir)?;
        let local_device = Arc::new(LocalDeviceManager::load(&data_dir, roms_dir.clone(), Arc::new(SysinfoProbe))?);
        let history = Arc::new(TransferHistoryStore::load(&data_dir)?);
        let ledger = Arc::new(LocalLedger::new(roms_dir));

        Ok(Self::with_parts(
            config_dir,
            data_dir,
            settings,
            repository,
            manager,
            history,
            local_device,
            ledger,
        ))
    }

    /// Assemble from prebuilt parts
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        config_dir: PathBuf,
        data_dir: PathBuf,
        settings: AppSettings,
        repository: Arc<ConnectionRepository>,
        manager: ConnectionManager,
        history: Arc<TransferHistoryStore>,
        local_device: Arc<LocalDeviceManager>,
        ledger: Arc<LocalLedger>,
    ) -> Self {
        let transfers = Arc::new(DeviceTransfers::new(
            manager.clone(),
            history.clone(),
            local_device.clone(),
            ledger.clone(),
            settings.storage.safety_buffer_percent,
        ));

        Self {
            config_dir,
            data_dir,
            settings: Arc::new(RwLock::new(settings)),
            repository,
            manager,
            history,
            local_device,
            ledger,
            transfers,
        }
    }

    /// Persist the current settings
    pub fn save_settings(&self) -> AppResult<()> {
        self.settings.read().save(&self.config_dir)
    }
}
