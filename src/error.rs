use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No credentials stored for connection {0}")]
    MissingCredentials(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Path not found on server: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote storage full: {0}")]
    RemoteStorageFull(String),

    #[error("Not enough storage space: {required} bytes required, {available} bytes available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Local file error: {0}")]
    LocalFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File validation failed: {0}")]
    Validation(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Where a failure originated, used by callers deciding what to show and whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Authentication,
    Transport,
    Protocol,
    LocalResource,
    Validation,
    Internal,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::InvalidConfig(_)
            | AppError::InvalidPath(_)
            | AppError::MissingCredentials(_)
            | AppError::ConnectionNotFound(_)
            | AppError::Config(_) => ErrorCategory::Configuration,
            AppError::Auth(_) => ErrorCategory::Authentication,
            AppError::Connection(_) | AppError::Timeout(_) => ErrorCategory::Transport,
            AppError::Sftp(_)
            | AppError::PathNotFound(_)
            | AppError::PermissionDenied(_)
            | AppError::RemoteStorageFull(_) => ErrorCategory::Protocol,
            AppError::InsufficientStorage { .. } | AppError::LocalFile(_) | AppError::Io(_) => {
                ErrorCategory::LocalResource
            }
            AppError::Validation(_) => ErrorCategory::Validation,
            AppError::Keychain(_) | AppError::Serialization(_) | AppError::Unknown(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// True when the remote host rejected us or could not be reached.
    /// These are the failures that make a cached "connected" status a lie.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Authentication | ErrorCategory::Transport
        )
    }

    /// Human-readable message safe to hand to the presentation layer
    pub fn user_message(&self) -> String {
        crate::logging::sanitize_error_message(&SerializableError::from(self).message)
    }
}

/// Serializable error for the presentation layer
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::InvalidConfig(msg) => ("INVALID_CONFIG", msg.clone(), None),
            AppError::InvalidPath(path) => ("INVALID_PATH", format!("Invalid path: {}", path), None),
            AppError::MissingCredentials(id) => (
                "MISSING_CREDENTIALS",
                "No credentials are stored for this device".to_string(),
                Some(id.clone()),
            ),
            AppError::ConnectionNotFound(id) => ("CONNECTION_NOT_FOUND", format!("Connection {} not found", id), None),
            AppError::Auth(msg) => ("AUTH_ERROR", "Authentication failed".to_string(), Some(msg.clone())),
            AppError::Connection(msg) => ("CONNECTION_ERROR", msg.clone(), None),
            AppError::Timeout(msg) => ("TIMEOUT", msg.clone(), None),
            AppError::Sftp(msg) => ("SFTP_ERROR", msg.clone(), None),
            AppError::PathNotFound(path) => ("PATH_NOT_FOUND", format!("Path not found on server: {}", path), None),
            AppError::PermissionDenied(msg) => ("PERMISSION_DENIED", msg.clone(), None),
            AppError::RemoteStorageFull(msg) => ("REMOTE_STORAGE_FULL", msg.clone(), None),
            AppError::InsufficientStorage { .. } => ("INSUFFICIENT_STORAGE", err.to_string(), None),
            AppError::LocalFile(msg) => ("LOCAL_FILE_ERROR", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone(), None),
            AppError::Keychain(msg) => ("KEYCHAIN_ERROR", msg.clone(), None),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
            AppError::Unknown(msg) => ("UNKNOWN_ERROR", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            category: err.category(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Keychain(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
