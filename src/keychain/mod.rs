pub mod credentials;
mod vault;

pub use credentials::*;

use crate::error::AppResult;
use keyring::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use vault::FallbackVault;

const SERVICE_NAME: &str = "rombridge";
const PROBE_KEY: &str = "__rombridge_keyring_test__";

/// Opaque key/value secret storage.
///
/// Implementations must never log secret values; keys are fine.
pub trait SecretStore: Send + Sync {
    fn put(&self, key: &str, secret: &str) -> AppResult<()>;
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    /// Removing a key that does not exist is not an error
    fn delete(&self, key: &str) -> AppResult<()>;
}

/// OS keychain with an encrypted-file fallback for systems without a keyring
/// (headless Linux, minimal containers).
pub struct KeyringSecretStore {
    service: String,
    vault: FallbackVault,
    fallback_warned: AtomicBool,
}

impl KeyringSecretStore {
    pub fn new(fallback_dir: PathBuf) -> Self {
        Self::with_service(SERVICE_NAME, fallback_dir)
    }

    pub fn with_service(service: impl Into<String>, fallback_dir: PathBuf) -> Self {
        Self {
            service: service.into(),
            vault: FallbackVault::new(fallback_dir),
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Check keyring availability by writing and removing a probe entry
    pub fn keyring_status(&self) -> KeyringStatus {
        let probe = Entry::new(&self.service, PROBE_KEY).and_then(|entry| {
            entry.set_password("probe")?;
            entry.delete_password()
        });

        match probe {
            Ok(()) => KeyringStatus {
                available: true,
                backend: detect_backend().to_string(),
                using_fallback: false,
                warning: None,
            },
            Err(e) => KeyringStatus {
                available: false,
                backend: "encrypted-file".to_string(),
                using_fallback: true,
                warning: Some(format!(
                    "OS keyring unavailable ({}). Device credentials are kept in an encrypted local file.",
                    e
                )),
            },
        }
    }

    fn warn_fallback(&self) {
        if !self.fallback_warned.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "No OS keyring available, device credentials will be stored in {}. \
                 Install gnome-keyring, KWallet or keepassxc for secure storage.",
                self.vault.data_path().display()
            );
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn put(&self, key: &str, secret: &str) -> AppResult<()> {
        match Entry::new(&self.service, key).and_then(|entry| entry.set_password(secret)) {
            Ok(()) => {
                tracing::debug!("Stored {} secret in OS keychain", secret_kind(key));
                Ok(())
            }
            Err(e) => {
                tracing::debug!("OS keychain rejected {} secret: {}", secret_kind(key), e);
                self.warn_fallback();
                self.vault.put(key, secret)
            }
        }
    }

    fn get(&self, key: &str) -> AppResult<Option<String>> {
        match Entry::new(&self.service, key).and_then(|entry| entry.get_password()) {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => self.vault.get(key),
            Err(e) => {
                tracing::debug!("OS keychain read failed, trying fallback: {}", e);
                self.vault.get(key)
            }
        }
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        if let Ok(entry) = Entry::new(&self.service, key) {
            match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!("OS keychain delete failed: {}", e),
            }
        }
        self.vault.remove(key)?;

        tracing::debug!("Deleted {} secret", secret_kind(key));
        Ok(())
    }
}

/// In-memory store for tests and embedders that bring their own persistence
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.lock().is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn put(&self, key: &str, secret: &str) -> AppResult<()> {
        self.secrets.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.secrets.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        self.secrets.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyringStatus {
    pub available: bool,
    pub backend: String,
    pub using_fallback: bool,
    pub warning: Option<String>,
}

fn detect_backend() -> &'static str {
    if cfg!(target_os = "macos") {
        "macOS Keychain"
    } else if cfg!(target_os = "windows") {
        "Windows Credential Manager"
    } else if cfg!(target_os = "linux") {
        "Secret Service (D-Bus)"
    } else {
        "Unknown"
    }
}

/// The prefix of a keychain key (`password`, `key`, `passphrase`); safe to log
fn secret_kind(key: &str) -> &str {
    key.split(':').next().unwrap_or("unknown")
}
