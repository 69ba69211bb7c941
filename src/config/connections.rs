use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// How a connection authenticates against the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Password,
    Key,
    PasswordWithKey,
}

impl AuthMode {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::Key => "key",
            AuthMode::PasswordWithKey => "password+key",
        }
    }
}

/// Last known liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Error,
}

impl ConnectionStatus {
    /// `Connected` and `Error` are the states a status check settles in
    pub fn is_settled(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Error)
    }
}

/// Kind of device a transfer went to or came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Local,
    Sftp,
}

/// A persisted remote SFTP target. Secrets live in the credential store, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_mode: AuthMode,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    pub status: ConnectionStatus,
    #[serde(skip)]
    pub last_error: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_root_path() -> String {
    "/".to_string()
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        auth_mode: AuthMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_mode,
            root_path: default_root_path(),
            is_default: false,
            last_connected_at: None,
            created_at: now,
            updated_at: now,
            status: ConnectionStatus::Disconnected,
            last_error: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    /// `user@host:port`, used in log lines and device pickers
    pub fn connection_string(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Apply a status transition. Every transition bumps `updated_at`;
    /// reaching `Connected` also stamps `last_connected_at` and clears the error.
    pub fn update_status(&mut self, status: ConnectionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        match status {
            ConnectionStatus::Connected => {
                self.last_connected_at = Some(now);
                self.last_error = None;
            }
            ConnectionStatus::Error => self.last_error = error,
            _ => {}
        }
    }

    /// Reject configurations that can never work, before any network call
    pub fn validate(&self) -> AppResult<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(AppError::InvalidConfig("Host is required".into()));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(AppError::InvalidConfig(format!("Host '{}' contains whitespace", host)));
        }
        if self.port == 0 {
            return Err(AppError::InvalidConfig("Port must be between 1 and 65535".into()));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::InvalidConfig("Username is required".into()));
        }
        if !self.root_path.starts_with('/') {
            return Err(AppError::InvalidPath(self.root_path.clone()));
        }
        Ok(())
    }
}

/// A bookmarked remote path under a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteDirectory {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl FavoriteDirectory {
    /// `name` falls back to the last path component (or the path itself for `/`)
    pub fn new(connection_id: Uuid, path: impl Into<String>, name: Option<String>) -> AppResult<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(AppError::InvalidPath(path));
        }
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| {
                Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.clone())
            });

        Ok(Self {
            id: Uuid::new_v4(),
            connection_id,
            path,
            name,
            created_at: Utc::now(),
        })
    }
}
