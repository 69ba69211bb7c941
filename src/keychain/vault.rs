//! Encrypted secrets file used when the OS keyring is missing.
//!
//! Layout: `.secrets.enc` holds `nonce (12 bytes) || AES-256-GCM(json map)`,
//! `.vault.key` holds the raw 32-byte key. Both are 0600. The key lives next to
//! the data, so this only keeps secrets out of plain sight.

use crate::config::write_atomic;
use crate::error::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub(crate) struct FallbackVault {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FallbackVault {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(".secrets.enc")
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(".vault.key")
    }

    pub fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    pub fn put(&self, key: &str, secret: &str) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        let mut secrets = self.read_all()?;
        secrets.insert(key.to_string(), secret.to_string());
        self.write_all(&secrets)
    }

    /// Returns whether anything was removed
    pub fn remove(&self, key: &str) -> AppResult<bool> {
        if !self.data_path().exists() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock();
        let mut secrets = self.read_all()?;
        if secrets.remove(key).is_none() {
            return Ok(false);
        }
        self.write_all(&secrets)?;
        Ok(true)
    }

    fn read_all(&self) -> AppResult<HashMap<String, String>> {
        let sealed = match fs::read(self.data_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(AppError::Keychain(format!("Cannot read secrets file: {}", e))),
        };
        if sealed.len() <= NONCE_LEN {
            return Ok(HashMap::new());
        }

        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| AppError::Keychain("Secrets file could not be decrypted".into()))?;
        serde_json::from_slice(&plain).map_err(|e| AppError::Keychain(format!("Secrets file is corrupt: {}", e)))
    }

    fn write_all(&self, secrets: &HashMap<String, String>) -> AppResult<()> {
        let plain = serde_json::to_vec(secrets)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let body = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| AppError::Keychain("Could not encrypt secrets".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);

        let path = self.data_path();
        write_atomic(&path, &sealed)?;
        restrict_permissions(&path);
        Ok(())
    }

    fn cipher(&self) -> AppResult<Aes256Gcm> {
        let key = self.load_or_create_key()?;
        Aes256Gcm::new_from_slice(&key).map_err(|e| AppError::Keychain(format!("Bad vault key: {}", e)))
    }

    fn load_or_create_key(&self) -> AppResult<[u8; KEY_LEN]> {
        let path = self.key_path();
        if let Ok(bytes) = fs::read(&path) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return Ok(key);
            }
            tracing::warn!("Vault key at {} has the wrong length, replacing it", path.display());
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        fs::create_dir_all(&self.dir)?;
        write_atomic(&path, &key)?;
        restrict_permissions(&path);
        Ok(key)
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Could not restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = FallbackVault::new(dir.path().to_path_buf());
            vault.put("password:abc", "hunter2").unwrap();
            vault.put("key:abc", "-----BEGIN-----").unwrap();
        }

        let vault = FallbackVault::new(dir.path().to_path_buf());
        assert_eq!(vault.get("password:abc").unwrap().as_deref(), Some("hunter2"));
        assert!(vault.remove("key:abc").unwrap());
        assert!(!vault.remove("key:abc").unwrap());
        assert_eq!(vault.get("key:abc").unwrap(), None);

        let raw = fs::read(vault.data_path()).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("hunter2"));
    }

    #[test]
    fn test_wrong_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FallbackVault::new(dir.path().to_path_buf());
        vault.put("password:abc", "hunter2").unwrap();

        fs::write(dir.path().join(".vault.key"), [7u8; KEY_LEN]).unwrap();
        assert!(matches!(vault.get("password:abc"), Err(AppError::Keychain(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let vault = FallbackVault::new(dir.path().to_path_buf());
        vault.put("password:abc", "x").unwrap();

        for name in [".secrets.enc", ".vault.key"] {
            let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", name);
        }
    }
}
