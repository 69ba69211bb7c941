//! Persistent connection records and favorite directories.
//!
//! Metadata lives in `connections.toml`; secrets go through [`CredentialStore`].
//! A save either lands both or neither.

use super::{write_atomic, Connection, ConnectionStatus, FavoriteDirectory};
use crate::error::{AppError, AppResult};
use crate::keychain::{CredentialStore, Credentials};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use uuid::Uuid;

const CONNECTIONS_FILE: &str = "connections.toml";

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    connections: Vec<Connection>,
    #[serde(default)]
    favorites: Vec<FavoriteDirectory>,
    /// Settings revision per connection, bumped by every save. Not persisted.
    #[serde(skip)]
    revisions: HashMap<Uuid, u64>,
}

impl ConnectionsFile {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.connections.iter().position(|c| c.id == id)
    }

    fn set_default(&mut self, id: Option<Uuid>) {
        let now = Utc::now();
        for conn in &mut self.connections {
            let want = Some(conn.id) == id;
            if conn.is_default != want {
                conn.is_default = want;
                conn.updated_at = now;
            }
        }
    }
}

pub struct ConnectionRepository {
    file: RwLock<ConnectionsFile>,
    path: PathBuf,
    credentials: CredentialStore,
    changes: watch::Sender<Vec<Connection>>,
    next_revision: AtomicU64,
}

impl ConnectionRepository {
    pub fn load(config_dir: &Path, credentials: CredentialStore) -> AppResult<Self> {
        Self::open(config_dir.join(CONNECTIONS_FILE), credentials)
    }

    pub fn open(path: PathBuf, credentials: CredentialStore) -> AppResult<Self> {
        let mut file = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<ConnectionsFile>(&content)?
        } else {
            ConnectionsFile::default()
        };

        // A hand-edited file may carry several defaults; keep the first
        if let Some(first) = file.connections.iter().find(|c| c.is_default).map(|c| c.id) {
            file.set_default(Some(first));
        }

        file.revisions = file.connections.iter().map(|c| (c.id, 0)).collect();

        tracing::debug!("Loaded {} connections from {}", file.connections.len(), path.display());
        let (changes, _) = watch::channel(file.connections.clone());

        Ok(Self {
            file: RwLock::new(file),
            path,
            credentials,
            changes,
            next_revision: AtomicU64::new(1),
        })
    }

    /// All connections, in the order they were first saved
    pub fn list_connections(&self) -> Vec<Connection> {
        self.file.read().connections.clone()
    }

    pub fn get_connection(&self, id: Uuid) -> Option<Connection> {
        let file = self.file.read();
        file.position(id).map(|i| file.connections[i].clone())
    }

    pub fn get_default_connection(&self) -> Option<Connection> {
        self.file.read().connections.iter().find(|c| c.is_default).cloned()
    }

    /// Changes whenever the connection's settings or secrets are saved.
    /// Status bookkeeping such as [`record_connected`](Self::record_connected)
    /// leaves it alone. `None` once the connection is gone.
    pub fn revision(&self, id: Uuid) -> Option<u64> {
        self.file.read().revisions.get(&id).copied()
    }

    /// Watch the connection list. The receiver holds the current list immediately
    /// and sees a new one after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Connection>> {
        self.changes.subscribe()
    }

    /// Insert or update a connection together with its secrets.
    ///
    /// On failure, neither the metadata nor the secrets change.
    pub fn save_connection(&self, connection: Connection, credentials: &Credentials) -> AppResult<Connection> {
        connection.validate()?;
        credentials.check_matches(&connection)?;

        let mut file = self.file.write();
        let mut next = file.clone();
        let mut connection = connection;
        connection.updated_at = Utc::now();

        match next.position(connection.id) {
            Some(i) => {
                let existing = &next.connections[i];
                connection.created_at = existing.created_at;
                connection.last_connected_at = connection.last_connected_at.or(existing.last_connected_at);
                next.connections[i] = connection.clone();
            }
            None => next.connections.push(connection.clone()),
        }
        if connection.is_default {
            next.set_default(Some(connection.id));
        }
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed);
        next.revisions.insert(connection.id, revision);

        let snapshot = self.credentials.snapshot(connection.id)?;
        if let Err(e) = self.credentials.save(connection.id, credentials) {
            self.credentials.restore(snapshot);
            return Err(e);
        }
        if let Err(e) = self.persist(&next) {
            self.credentials.restore(snapshot);
            return Err(e);
        }

        *file = next;
        self.notify(&file);
        tracing::info!("Saved connection {} ({})", connection.name, connection.connection_string());
        Ok(connection)
    }

    /// Remove a connection, its favorites and its secrets. A removed default is not replaced.
    pub fn delete_connection(&self, id: Uuid) -> AppResult<()> {
        let mut file = self.file.write();
        let mut next = file.clone();
        let index = next
            .position(id)
            .ok_or_else(|| AppError::ConnectionNotFound(id.to_string()))?;
        let removed = next.connections.remove(index);
        next.favorites.retain(|f| f.connection_id != id);
        next.revisions.remove(&id);

        self.persist(&next)?;
        *file = next;
        self.notify(&file);
        drop(file);

        self.credentials.delete(id)?;
        tracing::info!("Deleted connection {}", removed.name);
        Ok(())
    }

    pub fn set_default_connection(&self, id: Uuid) -> AppResult<()> {
        self.mutate(|file| {
            if file.position(id).is_none() {
                return Err(AppError::ConnectionNotFound(id.to_string()));
            }
            file.set_default(Some(id));
            Ok(())
        })
    }

    pub fn clear_default_connection(&self) -> AppResult<()> {
        self.mutate(|file| {
            file.set_default(None);
            Ok(())
        })
    }

    /// Apply a transition to `Connected` and persist the new `last_connected_at`
    pub fn record_connected(&self, id: Uuid) -> AppResult<()> {
        self.mutate(|file| {
            let index = file
                .position(id)
                .ok_or_else(|| AppError::ConnectionNotFound(id.to_string()))?;
            file.connections[index].update_status(ConnectionStatus::Connected, None);
            Ok(())
        })
    }

    pub fn get_credentials(&self, connection_id: Uuid) -> AppResult<Option<Credentials>> {
        match self.get_connection(connection_id) {
            Some(connection) => self.credentials.load(&connection),
            None => Ok(None),
        }
    }

    pub fn favorite_directories(&self, connection_id: Uuid) -> Vec<FavoriteDirectory> {
        self.file
            .read()
            .favorites
            .iter()
            .filter(|f| f.connection_id == connection_id)
            .cloned()
            .collect()
    }

    /// Bookmark a path. Adding a path that is already bookmarked returns the existing entry.
    pub fn add_favorite_directory(
        &self,
        connection_id: Uuid,
        path: &str,
        name: Option<String>,
    ) -> AppResult<FavoriteDirectory> {
        let favorite = FavoriteDirectory::new(connection_id, path, name)?;
        let mut added = favorite.clone();

        self.mutate(|file| {
            if file.position(connection_id).is_none() {
                return Err(AppError::ConnectionNotFound(connection_id.to_string()));
            }
            if let Some(existing) = file
                .favorites
                .iter()
                .find(|f| f.connection_id == connection_id && f.path == favorite.path)
            {
                added = existing.clone();
                return Ok(());
            }
            file.favorites.push(favorite);
            Ok(())
        })?;

        Ok(added)
    }

    pub fn remove_favorite_directory(&self, connection_id: Uuid, favorite_id: Uuid) -> AppResult<()> {
        self.mutate(|file| {
            let before = file.favorites.len();
            file.favorites
                .retain(|f| !(f.connection_id == connection_id && f.id == favorite_id));
            if file.favorites.len() == before {
                return Err(AppError::InvalidConfig(format!("Favorite {} not found", favorite_id)));
            }
            Ok(())
        })
    }

    /// Apply `change` to a copy, persist it, then publish it
    fn mutate<F>(&self, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut ConnectionsFile) -> AppResult<()>,
    {
        let mut file = self.file.write();
        let mut next = file.clone();
        change(&mut next)?;
        self.persist(&next)?;
        *file = next;
        self.notify(&file);
        Ok(())
    }

    fn persist(&self, file: &ConnectionsFile) -> AppResult<()> {
        let content = toml::to_string_pretty(file)?;
        write_atomic(&self.path, content.as_bytes())
    }

    fn notify(&self, file: &ConnectionsFile) {
        self.changes.send_replace(file.connections.clone());
    }
}
