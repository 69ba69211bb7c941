//! Device credentials and their mapping onto keychain entries.
//!
//! A connection's secrets are stored under `password:<id>`, `key:<id>` and
//! `passphrase:<id>`. Nothing in this module writes secrets anywhere else.

use super::SecretStore;
use crate::config::{AuthMode, Connection};
use crate::error::{AppError, AppResult};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const PASSWORD_PREFIX: &str = "password";
const KEY_PREFIX: &str = "key";
const PASSPHRASE_PREFIX: &str = "passphrase";
const ALL_PREFIXES: [&str; 3] = [PASSWORD_PREFIX, KEY_PREFIX, PASSPHRASE_PREFIX];

/// Secret material, shaped by auth mode
#[derive(Clone, PartialEq, Eq)]
pub enum AuthSecret {
    Password {
        password: String,
    },
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
    /// Key first, password if the key is refused
    PasswordWithKey {
        password: String,
        private_key: String,
        passphrase: Option<String>,
    },
}

impl AuthSecret {
    pub fn mode(&self) -> AuthMode {
        match self {
            AuthSecret::Password { .. } => AuthMode::Password,
            AuthSecret::Key { .. } => AuthMode::Key,
            AuthSecret::PasswordWithKey { .. } => AuthMode::PasswordWithKey,
        }
    }

    fn validate(&self) -> AppResult<()> {
        let (password, key) = match self {
            AuthSecret::Password { password } => (Some(password), None),
            AuthSecret::Key { private_key, .. } => (None, Some(private_key)),
            AuthSecret::PasswordWithKey { password, private_key, .. } => (Some(password), Some(private_key)),
        };
        if password.is_some_and(|p| p.is_empty()) {
            return Err(AppError::InvalidConfig("Password is required for this auth mode".into()));
        }
        if key.is_some_and(|k| k.trim().is_empty()) {
            return Err(AppError::InvalidConfig("Private key is required for this auth mode".into()));
        }
        Ok(())
    }
}

/// Credentials for one connection.
///
/// Host, port and username duplicate the connection's fields so a mismatched
/// pair is caught before anything is written.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: AuthSecret,
}

impl Credentials {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, secret: AuthSecret) -> AppResult<Self> {
        secret.validate()?;
        Ok(Self {
            host: host.into(),
            port,
            username: username.into(),
            secret,
        })
    }

    pub fn for_connection(connection: &Connection, secret: AuthSecret) -> AppResult<Self> {
        let credentials = Self::new(&connection.host, connection.port, &connection.username, secret)?;
        credentials.check_matches(connection)?;
        Ok(credentials)
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.secret.mode()
    }

    pub fn password(&self) -> Option<&str> {
        match &self.secret {
            AuthSecret::Password { password } | AuthSecret::PasswordWithKey { password, .. } => Some(password),
            AuthSecret::Key { .. } => None,
        }
    }

    pub fn private_key(&self) -> Option<&str> {
        match &self.secret {
            AuthSecret::Key { private_key, .. } | AuthSecret::PasswordWithKey { private_key, .. } => Some(private_key),
            AuthSecret::Password { .. } => None,
        }
    }

    pub fn passphrase(&self) -> Option<&str> {
        match &self.secret {
            AuthSecret::Key { passphrase, .. } | AuthSecret::PasswordWithKey { passphrase, .. } => {
                passphrase.as_deref()
            }
            AuthSecret::Password { .. } => None,
        }
    }

    /// The owning connection must agree on mode and endpoint
    pub fn check_matches(&self, connection: &Connection) -> AppResult<()> {
        if self.auth_mode() != connection.auth_mode {
            return Err(AppError::InvalidConfig(format!(
                "Credentials are for {} auth but the connection uses {}",
                self.auth_mode().label(),
                connection.auth_mode.label()
            )));
        }
        if !self.host.eq_ignore_ascii_case(&connection.host)
            || self.port != connection.port
            || self.username != connection.username
        {
            return Err(AppError::InvalidConfig(format!(
                "Credentials do not belong to {}",
                connection.connection_string()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_mode", &self.auth_mode())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Validate keychain key format.
/// Keys are `<prefix>:<id>` where prefix is `password`, `key` or `passphrase`
/// and the id is ASCII alphanumeric plus `-` and `_`.
pub fn validate_keychain_key(key: &str) -> AppResult<()> {
    let (prefix, id) = key
        .split_once(':')
        .ok_or_else(|| AppError::Keychain(format!("Invalid keychain key format: {}", key)))?;

    if !ALL_PREFIXES.contains(&prefix) {
        return Err(AppError::Keychain(format!("Invalid keychain key prefix: {}", prefix)));
    }
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(AppError::Keychain("Invalid characters in keychain key".into()));
    }
    Ok(())
}

fn keychain_key(prefix: &str, connection_id: Uuid) -> String {
    format!("{}:{}", prefix, connection_id)
}

/// Previous secret values for one connection, used to roll back a failed save
#[derive(Clone, Default)]
pub struct SecretSnapshot {
    entries: Vec<(String, Option<String>)>,
}

impl fmt::Debug for SecretSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self.entries.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SecretSnapshot").field("keys", &keys).finish()
    }
}

/// Reads and writes connection credentials through a [`SecretStore`]
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn SecretStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    fn put(&self, key: &str, secret: &str) -> AppResult<()> {
        validate_keychain_key(key)?;
        self.store.put(key, secret)
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        validate_keychain_key(key)?;
        self.store.delete(key)
    }

    /// Write the secrets for `connection_id`, dropping those another mode left behind
    pub fn save(&self, connection_id: Uuid, credentials: &Credentials) -> AppResult<()> {
        let password_key = keychain_key(PASSWORD_PREFIX, connection_id);
        let key_key = keychain_key(KEY_PREFIX, connection_id);
        let passphrase_key = keychain_key(PASSPHRASE_PREFIX, connection_id);

        match credentials.password() {
            Some(password) => self.put(&password_key, password)?,
            None => self.remove(&password_key)?,
        }
        match credentials.private_key() {
            Some(private_key) => self.put(&key_key, private_key)?,
            None => self.remove(&key_key)?,
        }
        match credentials.passphrase() {
            Some(passphrase) if !passphrase.is_empty() => self.put(&passphrase_key, passphrase)?,
            _ => self.remove(&passphrase_key)?,
        }

        tracing::debug!(
            "Saved {} credentials for connection {}",
            credentials.auth_mode().label(),
            connection_id
        );
        Ok(())
    }

    /// Load the credentials for a connection. `None` when the secrets its mode needs are absent.
    pub fn load(&self, connection: &Connection) -> AppResult<Option<Credentials>> {
        let id = connection.id;
        let password = self.store.get(&keychain_key(PASSWORD_PREFIX, id))?;
        let private_key = self.store.get(&keychain_key(KEY_PREFIX, id))?;
        let passphrase = self.store.get(&keychain_key(PASSPHRASE_PREFIX, id))?;

        let secret = match (connection.auth_mode, password, private_key) {
            (AuthMode::Password, Some(password), _) => AuthSecret::Password { password },
            (AuthMode::Key, _, Some(private_key)) => AuthSecret::Key { private_key, passphrase },
            (AuthMode::PasswordWithKey, Some(password), Some(private_key)) => AuthSecret::PasswordWithKey {
                password,
                private_key,
                passphrase,
            },
            _ => return Ok(None),
        };

        Credentials::new(&connection.host, connection.port, &connection.username, secret).map(Some)
    }

    pub fn delete(&self, connection_id: Uuid) -> AppResult<()> {
        for prefix in ALL_PREFIXES {
            self.remove(&keychain_key(prefix, connection_id))?;
        }
        Ok(())
    }

    pub fn snapshot(&self, connection_id: Uuid) -> AppResult<SecretSnapshot> {
        let mut entries = Vec::with_capacity(ALL_PREFIXES.len());
        for prefix in ALL_PREFIXES {
            let key = keychain_key(prefix, connection_id);
            let value = self.store.get(&key)?;
            entries.push((key, value));
        }
        Ok(SecretSnapshot { entries })
    }

    /// Put every secret back the way the snapshot saw it. Best effort: failures are logged.
    pub fn restore(&self, snapshot: SecretSnapshot) {
        for (key, value) in snapshot.entries {
            let result = match value {
                Some(secret) => self.store.put(&key, &secret),
                None => self.store.delete(&key),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to roll back keychain entry: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemorySecretStore;

    fn connection(mode: AuthMode) -> Connection {
        Connection::new("Deck", "deck.local", "deck", mode)
    }

    #[test]
    fn test_validate_keychain_key() {
        assert!(validate_keychain_key("password:abc-123").is_ok());
        assert!(validate_keychain_key("key:my_key").is_ok());
        assert!(validate_keychain_key("passphrase:550e8400-e29b-41d4-a716-446655440000").is_ok());

        assert!(validate_keychain_key("token:abc").is_err());
        assert!(validate_keychain_key("password").is_err());
        assert!(validate_keychain_key("password:").is_err());
        assert!(validate_keychain_key("password:a/b").is_err());
    }

    #[test]
    fn test_construction_rejects_empty_material() {
        let secret = AuthSecret::Key { private_key: "  ".into(), passphrase: None };
        assert!(Credentials::new("h", 22, "u", secret).is_err());

        let secret = AuthSecret::Password { password: String::new() };
        assert!(Credentials::new("h", 22, "u", secret).is_err());
    }

    #[test]
    fn test_check_matches_mode_and_endpoint() {
        let conn = connection(AuthMode::Key);
        let secret = AuthSecret::Password { password: "pw".into() };
        assert!(Credentials::for_connection(&conn, secret).is_err());

        let secret = AuthSecret::Key { private_key: "KEY".into(), passphrase: None };
        let creds = Credentials::new("other.local", 22, "deck", secret).unwrap();
        assert!(creds.check_matches(&conn).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let conn = connection(AuthMode::Password);
        let creds = Credentials::for_connection(&conn, AuthSecret::Password { password: "hunter2".into() }).unwrap();
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_mode_change_drops_stale_secrets() {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = CredentialStore::new(secrets.clone());

        let mut conn = connection(AuthMode::PasswordWithKey);
        let creds = Credentials::for_connection(
            &conn,
            AuthSecret::PasswordWithKey {
                password: "pw".into(),
                private_key: "KEY".into(),
                passphrase: Some("phrase".into()),
            },
        )
        .unwrap();
        store.save(conn.id, &creds).unwrap();
        assert_eq!(secrets.len(), 3);
        assert_eq!(store.load(&conn).unwrap(), Some(creds));

        conn.auth_mode = AuthMode::Password;
        let creds = Credentials::for_connection(&conn, AuthSecret::Password { password: "pw2".into() }).unwrap();
        store.save(conn.id, &creds).unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(store.load(&conn).unwrap().unwrap().password(), Some("pw2"));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()));
        assert!(store.load(&connection(AuthMode::Key)).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()));
        let conn = connection(AuthMode::Password);
        let old = Credentials::for_connection(&conn, AuthSecret::Password { password: "old".into() }).unwrap();
        store.save(conn.id, &old).unwrap();

        let snapshot = store.snapshot(conn.id).unwrap();
        let new = Credentials::for_connection(&conn, AuthSecret::Password { password: "new".into() }).unwrap();
        store.save(conn.id, &new).unwrap();
        store.restore(snapshot);

        assert_eq!(store.load(&conn).unwrap(), Some(old));
    }
}
