//! Connection manager: cache-aware operations on saved connections.
//!
//! One instance is built by [`crate::state::AppState`] and shared by cloning.
//! The per-connection status cache is the only mutable state here; it is
//! touched through the check path in [`ConnectionManager::check_connection`]
//! and by operation results (success refreshes, connectivity failures downgrade).

pub mod status;

pub use status::StatusReport;

use crate::config::{Connection, ConnectionRepository, ConnectionStatus, TransferSettings};
use crate::error::{AppError, AppResult};
use crate::keychain::Credentials;
use crate::sftp::{
    DirectoryEntry, ProgressThrottle, TransferClient, TransferControl, TransferProgress, UploadJob, UploadOutcome,
};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use status::{CacheEntry, InFlight, SharedCheck};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATUS_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a settled status is served from cache
    pub status_ttl: Duration,
    /// Upper bound on one status probe, connect included
    pub check_timeout: Duration,
    pub max_concurrent_checks: usize,
    pub progress_interval: Duration,
}

impl From<&TransferSettings> for ManagerConfig {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            status_ttl: settings.status_cache_ttl(),
            check_timeout: settings.status_check_timeout(),
            max_concurrent_checks: settings.max_concurrent_checks.max(1),
            progress_interval: settings.progress_interval(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&TransferSettings::default())
    }
}

struct ManagerInner {
    repository: Arc<ConnectionRepository>,
    client: Arc<dyn TransferClient>,
    cache: DashMap<Uuid, CacheEntry>,
    next_check_id: AtomicU64,
    busy: DashMap<Uuid, usize>,
    events: broadcast::Sender<StatusReport>,
    config: ManagerConfig,
    /// Repository connection list as of the last prune
    changes: Mutex<watch::Receiver<Vec<Connection>>>,
}

impl ManagerInner {
    fn credentials_for(&self, connection: &Connection) -> AppResult<Credentials> {
        self.repository
            .get_credentials(connection.id)?
            .ok_or_else(|| AppError::MissingCredentials(connection.id.to_string()))
    }

    async fn probe(&self, check_id: u64, connection: &Connection) -> AppResult<()> {
        connection.validate()?;
        let credentials = self.credentials_for(connection)?;
        self.advance(connection.id, check_id, ConnectionStatus::Authenticating);

        let client = self.client.clone();
        let connection = connection.clone();
        run_blocking(Some(self.config.check_timeout), move || {
            client.test_connection(&connection, &credentials)
        })
        .await
    }

    /// Drop cached statuses of saved connections that have since been deleted.
    /// Entries for never-saved connections stay.
    fn forget_deleted(&self) {
        let mut changes = self.changes.lock();
        if !changes.has_changed().unwrap_or(false) {
            return;
        }
        let live: HashSet<Uuid> = changes.borrow_and_update().iter().map(|c| c.id).collect();
        self.cache
            .retain(|id, entry| live.contains(id) || entry.revision.is_none());
    }

    /// Move a running check to an intermediate status and tell subscribers
    fn advance(&self, id: Uuid, check_id: u64, status: ConnectionStatus) {
        let report = match self.cache.get_mut(&id) {
            Some(mut entry) if entry.in_flight.as_ref().is_some_and(|running| running.id == check_id) => {
                entry.report.status = status;
                entry.report.clone()
            }
            _ => return,
        };
        let _ = self.events.send(report);
    }

    /// Settle check `check_id`. Returns false, changing nothing, when the
    /// check was superseded or its entry cleared.
    fn finish_check(&self, id: Uuid, check_id: u64, report: StatusReport) -> bool {
        let recorded = self
            .cache
            .get_mut(&id)
            .is_some_and(|mut entry| entry.settle(check_id, report.clone()));
        if recorded {
            self.announce(report);
        }
        recorded
    }

    /// Record a result learned outside a status check
    fn record(&self, report: StatusReport) {
        let id = report.connection_id;
        let revision = self.repository.revision(id);
        {
            let mut entry = self.cache.entry(id).or_insert_with(|| CacheEntry::new(id, revision));
            entry.retarget(revision);
            entry.set(report.clone());
        }
        self.announce(report);
    }

    /// Publish a settled report; a `Connected` one is also persisted
    fn announce(&self, report: StatusReport) {
        if report.status == ConnectionStatus::Connected {
            match self.repository.record_connected(report.connection_id) {
                Ok(()) | Err(AppError::ConnectionNotFound(_)) => {}
                Err(e) => warn!("Could not persist last connection time: {}", e),
            }
        }
        let _ = self.events.send(report);
    }
}

/// Counts an active upload for [`ConnectionManager::is_busy`] until dropped
struct BusyGuard {
    inner: Arc<ManagerInner>,
    id: Uuid,
}

impl BusyGuard {
    fn acquire(inner: Arc<ManagerInner>, id: Uuid) -> Self {
        *inner.busy.entry(id).or_insert(0) += 1;
        Self { inner, id }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.inner.busy.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
        self.inner.busy.remove_if(&self.id, |_, count| *count == 0);
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(repository: Arc<ConnectionRepository>, client: Arc<dyn TransferClient>, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let changes = Mutex::new(repository.subscribe());
        Self {
            inner: Arc::new(ManagerInner {
                repository,
                client,
                cache: DashMap::new(),
                next_check_id: AtomicU64::new(1),
                busy: DashMap::new(),
                events,
                config,
                changes,
            }),
        }
    }

    pub fn repository(&self) -> &Arc<ConnectionRepository> {
        &self.inner.repository
    }

    /// Status transitions as they happen: `Connecting` when a check starts,
    /// the settled status when it ends or an operation changes it
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusReport> {
        self.inner.events.subscribe()
    }

    pub fn status_of(&self, connection_id: Uuid) -> Option<StatusReport> {
        self.inner.forget_deleted();
        self.inner.cache.get(&connection_id).map(|entry| entry.report.clone())
    }

    pub fn is_busy(&self, connection_id: Uuid) -> bool {
        self.inner.busy.get(&connection_id).is_some_and(|count| *count > 0)
    }

    pub async fn check_connection_status(&self, connection: &Connection, force_refresh: bool) -> ConnectionStatus {
        self.check_connection(connection, force_refresh).await.status
    }

    /// Serve the cached status when fresh, otherwise probe the host.
    ///
    /// A check already running for this connection is joined rather than
    /// duplicated, `force_refresh` included. Saving the connection again
    /// (new settings or secrets) invalidates both.
    pub async fn check_connection(&self, connection: &Connection, force_refresh: bool) -> StatusReport {
        self.inner.forget_deleted();
        let revision = self.inner.repository.revision(connection.id);
        let check = {
            let mut entry = self
                .inner
                .cache
                .entry(connection.id)
                .or_insert_with(|| CacheEntry::new(connection.id, revision));
            entry.retarget(revision);

            if let Some(running) = &entry.in_flight {
                debug!("Joining running status check for {}", connection.name);
                running.check.clone()
            } else if !force_refresh && entry.is_fresh(self.inner.config.status_ttl) {
                debug!("Status cache hit for {}", connection.name);
                return entry.report.clone();
            } else {
                let check_id = self.inner.next_check_id.fetch_add(1, Ordering::Relaxed);
                let check = self.spawn_check(check_id, connection.clone());
                entry.in_flight = Some(InFlight {
                    id: check_id,
                    check: check.clone(),
                });
                entry.report.status = ConnectionStatus::Connecting;
                let _ = self.inner.events.send(entry.report.clone());
                check
            }
        };

        check.await
    }

    /// The probe runs in its own task so it settles the cache even if every waiter goes away
    fn spawn_check(&self, check_id: u64, connection: Connection) -> SharedCheck {
        let inner = self.inner.clone();
        let id = connection.id;

        let handle = tokio::spawn(async move {
            let result = inner.probe(check_id, &connection).await;
            match &result {
                Ok(()) => info!("{} is reachable", connection.connection_string()),
                Err(e) => info!(
                    "{} check failed: {}",
                    connection.connection_string(),
                    crate::logging::sanitize(&e.to_string())
                ),
            }

            let report = StatusReport::settled(id, result.map_err(|e| e.user_message()));
            if !inner.finish_check(id, check_id, report.clone()) {
                debug!("Discarding superseded status check for {}", connection.name);
            }
            report
        });

        let inner = Arc::downgrade(&self.inner);
        async move {
            match handle.await {
                Ok(report) => report,
                Err(e) => abandon_check(&inner, id, check_id, &e.to_string()),
            }
        }
        .boxed()
        .shared()
    }

    /// Check every connection, at most `max_concurrent_checks` at a time.
    /// Reports arrive in completion order.
    pub async fn check_all_connection_statuses(
        &self,
        connections: &[Connection],
        force_refresh: bool,
    ) -> Vec<StatusReport> {
        let limit = self.inner.config.max_concurrent_checks.max(1);
        stream::iter(connections.to_vec())
            .map(|connection| {
                let manager = self.clone();
                async move { manager.check_connection(&connection, force_refresh).await }
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    /// Probe a connection that may not be saved yet. The cache is left alone.
    pub async fn test_connection_with_credentials(
        &self,
        connection: &Connection,
        credentials: &Credentials,
    ) -> AppResult<()> {
        connection.validate()?;
        credentials.check_matches(connection)?;

        let client = self.inner.client.clone();
        let connection = connection.clone();
        let credentials = credentials.clone();
        run_blocking(Some(self.inner.config.check_timeout), move || {
            client.test_connection(&connection, &credentials)
        })
        .await
    }

    /// List a remote directory. An empty path lists the connection's root path.
    pub async fn list_directory(&self, path: &str, connection: &Connection) -> AppResult<Vec<DirectoryEntry>> {
        let path = match path.trim() {
            "" => connection.root_path.clone(),
            p => absolute_remote_path(p)?,
        };
        self.run_operation(connection, move |client, connection, credentials| {
            client.list_directory(&connection, &credentials, &path)
        })
        .await
    }

    pub async fn create_directory(&self, path: &str, connection: &Connection) -> AppResult<()> {
        let path = absolute_remote_path(path.trim())?;
        self.run_operation(connection, move |client, connection, credentials| {
            client.create_directory(&connection, &credentials, &path)
        })
        .await
    }

    /// Stream a local file to `remote_path`.
    ///
    /// `on_progress` runs on a blocking worker thread at chunk boundaries, at most
    /// once per progress interval, and always for the final chunk. Callers bound to
    /// a UI executor should pass the sender half of [`crate::sftp::progress_channel`].
    ///
    /// Cancelling `control`, or dropping the returned future, stops the transfer
    /// and removes the partial remote file.
    pub async fn upload_file<P>(
        &self,
        local_path: &Path,
        remote_path: &str,
        connection: &Connection,
        control: &TransferControl,
        on_progress: P,
    ) -> AppResult<UploadOutcome>
    where
        P: FnMut(TransferProgress) + Send + 'static,
    {
        let remote_path = absolute_remote_path(remote_path.trim())?;
        if remote_path.ends_with('/') {
            return Err(AppError::InvalidPath(remote_path));
        }

        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| AppError::LocalFile(format!("Cannot read {}: {}", local_path.display(), e)))?;
        if !metadata.is_file() {
            return Err(AppError::LocalFile(format!("{} is not a file", local_path.display())));
        }
        let total_bytes = metadata.len();

        let _busy = BusyGuard::acquire(self.inner.clone(), connection.id);
        let cancel_guard = control.cancel_on_drop();

        info!(
            "Uploading {} ({} bytes) to {}",
            local_path.display(),
            total_bytes,
            connection.connection_string()
        );

        let local_path = local_path.to_path_buf();
        let job_control = control.clone();
        let interval = self.inner.config.progress_interval;
        let result = self
            .run_operation(connection, move |client, connection, credentials| {
                let mut source = std::fs::File::open(&local_path)
                    .map_err(|e| AppError::LocalFile(format!("Cannot open {}: {}", local_path.display(), e)))?;
                let mut throttle = ProgressThrottle::new(interval, on_progress);
                let mut report = |sent: u64, total: u64| throttle.report(sent, total);

                client.upload(
                    &connection,
                    &credentials,
                    UploadJob {
                        source: &mut source,
                        total_bytes,
                        remote_path: &remote_path,
                        control: &job_control,
                        progress: &mut report,
                    },
                )
            })
            .await;
        cancel_guard.disarm();

        match &result {
            Ok(outcome) if outcome.is_completed() => info!("Upload finished, {} bytes sent", outcome.bytes_sent()),
            Ok(outcome) => info!("Upload cancelled after {} bytes", outcome.bytes_sent()),
            Err(e) => warn!("Upload failed: {}", crate::logging::sanitize(&e.to_string())),
        }
        result
    }

    /// Forget every cached status; the next check of any connection hits the network
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        debug!("Cleared status cache");
    }

    /// Forget one connection's cached status, e.g. after its credentials changed
    pub fn clear_cache_for(&self, connection_id: Uuid) {
        self.inner.cache.remove(&connection_id);
    }

    /// Run a blocking client call with the connection's saved credentials and
    /// fold the result into the status cache
    async fn run_operation<T, F>(&self, connection: &Connection, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn TransferClient>, Connection, Credentials) -> AppResult<T> + Send + 'static,
    {
        connection.validate()?;
        let credentials = self.inner.credentials_for(connection)?;
        let client = self.inner.client.clone();
        let owned = connection.clone();

        let result = run_blocking(None, move || op(client, owned, credentials)).await;
        match &result {
            Ok(_) => self.inner.record(StatusReport::settled(connection.id, Ok(()))),
            Err(e) if e.is_connectivity() => {
                warn!(
                    "Marking {} as unreachable: {}",
                    connection.name,
                    crate::logging::sanitize(&e.to_string())
                );
                self.inner
                    .record(StatusReport::settled(connection.id, Err(e.user_message())));
            }
            Err(_) => {}
        }
        result
    }
}

/// Settle a check whose task died before reporting, so later callers start a
/// fresh one instead of joining it
fn abandon_check(inner: &Weak<ManagerInner>, id: Uuid, check_id: u64, reason: &str) -> StatusReport {
    warn!("Status check for {} did not finish: {}", id, reason);
    let report = StatusReport::settled(id, Err("Status check aborted".to_string()));
    if let Some(inner) = inner.upgrade() {
        inner.finish_check(id, check_id, report.clone());
    }
    report
}

/// Remote paths handed to the manager must be absolute
fn absolute_remote_path(path: &str) -> AppResult<String> {
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Err(AppError::InvalidPath(path.to_string()))
    }
}

/// Run blocking client work on tokio's blocking pool. With a limit, the caller
/// stops waiting after it; the worker finishes on its own socket timeouts.
async fn run_blocking<T, F>(limit: Option<Duration>, work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    let joined = match limit {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| AppError::Timeout(format!("No response within {:?}", limit)))?,
        None => task.await,
    };
    joined.map_err(|e| AppError::Unknown(format!("Transfer worker failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMode;
    use crate::keychain::{AuthSecret, CredentialStore, MemorySecretStore, SecretStore};
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    #[derive(Default)]
    struct MockClient {
        test_calls: AtomicUsize,
        list_calls: AtomicUsize,
        test_delay: Duration,
        slow_host: Option<String>,
        chunk_delay: Duration,
        fail: Mutex<Option<fn(String) -> AppError>>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MockClient {
        fn fail_with(&self, make: fn(String) -> AppError) {
            *self.fail.lock() = Some(make);
        }

        fn failure(&self, what: &str) -> AppResult<()> {
            match *self.fail.lock() {
                Some(make) => Err(make(what.to_string())),
                None => Ok(()),
            }
        }
    }

    impl TransferClient for MockClient {
        fn test_connection(&self, connection: &Connection, _credentials: &Credentials) -> AppResult<()> {
            self.test_calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_host.as_deref() == Some(connection.host.as_str()) {
                std::thread::sleep(Duration::from_millis(800));
            } else {
                std::thread::sleep(self.test_delay);
            }
            self.failure("probe")
        }

        fn list_directory(
            &self,
            _connection: &Connection,
            _credentials: &Credentials,
            path: &str,
        ) -> AppResult<Vec<DirectoryEntry>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.failure(path)?;
            Ok(vec![DirectoryEntry {
                name: "snes".into(),
                parent_path: path.to_string(),
                path: format!("{}/snes", path.trim_end_matches('/')),
                size: 0,
                modified: None,
                is_directory: true,
                permissions: None,
                owner: None,
                group: None,
            }])
        }

        fn create_directory(&self, _connection: &Connection, _credentials: &Credentials, path: &str) -> AppResult<()> {
            self.failure(path)
        }

        fn upload(
            &self,
            _connection: &Connection,
            _credentials: &Credentials,
            job: UploadJob<'_>,
        ) -> AppResult<UploadOutcome> {
            let UploadJob {
                source,
                total_bytes,
                remote_path,
                control,
                progress,
            } = job;
            self.failure(remote_path)?;

            let mut buf = [0u8; 4];
            let mut data = Vec::new();
            loop {
                if control.is_cancelled() {
                    return Ok(UploadOutcome::Cancelled {
                        bytes_sent: data.len() as u64,
                    });
                }
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
                progress(data.len() as u64, total_bytes);
                std::thread::sleep(self.chunk_delay);
            }

            let bytes_sent = data.len() as u64;
            self.uploads.lock().push((remote_path.to_string(), data));
            Ok(UploadOutcome::Completed { bytes_sent })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        repo: Arc<ConnectionRepository>,
        client: Arc<MockClient>,
        manager: ConnectionManager,
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            status_ttl: Duration::from_secs(60),
            check_timeout: Duration::from_secs(2),
            max_concurrent_checks: 4,
            progress_interval: Duration::ZERO,
        }
    }

    /// Memory store whose reads panic once `crash` is set
    #[derive(Default)]
    struct CrashingSecretStore {
        secrets: MemorySecretStore,
        crash: AtomicBool,
    }

    impl SecretStore for CrashingSecretStore {
        fn put(&self, key: &str, secret: &str) -> AppResult<()> {
            self.secrets.put(key, secret)
        }

        fn get(&self, key: &str) -> AppResult<Option<String>> {
            if self.crash.load(Ordering::SeqCst) {
                panic!("secret backend crashed");
            }
            self.secrets.get(key)
        }

        fn delete(&self, key: &str) -> AppResult<()> {
            self.secrets.delete(key)
        }
    }

    fn fixture(client: MockClient, config: ManagerConfig) -> Fixture {
        fixture_with_secrets(client, config, Arc::new(MemorySecretStore::new()))
    }

    fn fixture_with_secrets(client: MockClient, config: ManagerConfig, secrets: Arc<dyn SecretStore>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::new(secrets);
        let repo = Arc::new(ConnectionRepository::load(dir.path(), credentials).unwrap());
        let client = Arc::new(client);
        let manager = ConnectionManager::new(repo.clone(), client.clone(), config);
        Fixture {
            dir,
            repo,
            client,
            manager,
        }
    }

    fn password_credentials(conn: &Connection) -> Credentials {
        Credentials::for_connection(conn, AuthSecret::Password { password: "pw".into() }).unwrap()
    }

    fn add_connection_with_id(repo: &ConnectionRepository, conn: &Connection) -> Connection {
        repo.save_connection(conn.clone(), &password_credentials(conn)).unwrap()
    }

    fn add_connection(repo: &ConnectionRepository, name: &str, host: &str) -> Connection {
        let conn = Connection::new(name, host, "deck", AuthMode::Password).with_root_path("/roms");
        let creds = password_credentials(&conn);
        repo.save_connection(conn, &creds).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_share_one_round_trip() {
        let fx = fixture(
            MockClient {
                test_delay: Duration::from_millis(200),
                ..Default::default()
            },
            test_config(),
        );
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        let checks = (0..10).map(|_| fx.manager.check_connection_status(&conn, false));
        let statuses = futures::future::join_all(checks).await;

        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);
        assert!(statuses.iter().all(|s| *s == ConnectionStatus::Connected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_checks_from_separate_tasks_coalesce() {
        let fx = fixture(
            MockClient {
                test_delay: Duration::from_millis(200),
                ..Default::default()
            },
            test_config(),
        );
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = fx.manager.clone();
                let conn = conn.clone();
                tokio::spawn(async move { manager.check_connection(&conn, false).await })
            })
            .collect();

        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.unwrap());
        }

        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);
        assert!(reports.iter().all(|r| *r == reports[0]));
        assert_eq!(reports[0].status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_cache_hit_and_forced_refresh() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Connected);
        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Connected);
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);

        assert_eq!(fx.manager.check_connection_status(&conn, true).await, ConnectionStatus::Connected);
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_rechecked() {
        let config = ManagerConfig {
            status_ttl: Duration::ZERO,
            ..test_config()
        };
        let fx = fixture(MockClient::default(), config);
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        fx.manager.check_connection_status(&conn, false).await;
        fx.manager.check_connection_status(&conn, false).await;
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_successful_check_persists_last_connected() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        assert!(conn.last_connected_at.is_none());

        let report = fx.manager.check_connection(&conn, false).await;
        assert!(report.checked_at.is_some());
        assert!(fx.repo.get_connection(conn.id).unwrap().last_connected_at.is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_downgrades_cached_status() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Connected);

        fx.client.fail_with(AppError::Auth);
        let err = fx.manager.list_directory("/roms", &conn).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));

        let cached = fx.manager.status_of(conn.id).unwrap();
        assert_eq!(cached.status, ConnectionStatus::Error);
        assert_eq!(cached.last_error.as_deref(), Some("Authentication failed"));

        // served from cache, still honest
        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Error);
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_protocol_error_keeps_status() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        fx.manager.check_connection_status(&conn, false).await;

        fx.client.fail_with(AppError::PathNotFound);
        let err = fx.manager.list_directory("/nope", &conn).await.unwrap_err();
        assert!(matches!(err, AppError::PathNotFound(_)));
        assert_eq!(fx.manager.status_of(conn.id).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_successful_operation_marks_connected() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        assert!(fx.manager.status_of(conn.id).is_none());

        fx.manager.create_directory("/roms/snes", &conn).await.unwrap();
        assert_eq!(fx.manager.status_of(conn.id).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_listing_paths() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        let entries = fx.manager.list_directory("", &conn).await.unwrap();
        assert_eq!(entries[0].parent_path, "/roms");

        let err = fx.manager.list_directory("roms/snes", &conn).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPath(_)));
        assert!(matches!(
            fx.manager.create_directory("", &conn).await,
            Err(AppError::InvalidPath(_))
        ));
        assert_eq!(fx.client.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_host_does_not_hold_up_others() {
        let config = ManagerConfig {
            check_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let fx = fixture(
            MockClient {
                slow_host: Some("slow.local".into()),
                ..Default::default()
            },
            config,
        );
        let slow = add_connection(&fx.repo, "Slow", "slow.local");
        let fast = add_connection(&fx.repo, "Fast", "fast.local");

        let started = Instant::now();
        let reports = fx
            .manager
            .check_all_connection_statuses(&[slow.clone(), fast.clone()], true)
            .await;
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(reports.len(), 2);

        let report_for = |id: Uuid| reports.iter().find(|r| r.connection_id == id).unwrap().clone();
        assert_eq!(report_for(fast.id).status, ConnectionStatus::Connected);
        let slow_report = report_for(slow.id);
        assert_eq!(slow_report.status, ConnectionStatus::Error);
        assert!(slow_report.last_error.is_some());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_an_error_status() {
        let fx = fixture(MockClient::default(), test_config());
        let unsaved = Connection::new("Ghost", "ghost.local", "deck", AuthMode::Password);

        let report = fx.manager.check_connection(&unsaved, false).await;
        assert_eq!(report.status, ConnectionStatus::Error);
        assert!(report.last_error.is_some());
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 0);

        assert!(matches!(
            fx.manager.list_directory("/", &unsaved).await,
            Err(AppError::MissingCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_cache_forces_network() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        fx.manager.check_connection_status(&conn, false).await;

        fx.manager.clear_cache_for(conn.id);
        assert!(fx.manager.status_of(conn.id).is_none());
        fx.manager.check_connection_status(&conn, false).await;

        fx.manager.clear_cache();
        fx.manager.check_connection_status(&conn, false).await;
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_status_events() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let mut events = fx.manager.subscribe_status();

        fx.manager.check_connection_status(&conn, false).await;
        assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Connecting);
        assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Authenticating);
        assert_eq!(events.recv().await.unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_saving_new_credentials_invalidates_cached_status() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        fx.client.fail_with(AppError::Auth);
        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Error);

        *fx.client.fail.lock() = None;
        let fixed = Credentials::for_connection(&conn, AuthSecret::Password { password: "fixed".into() }).unwrap();
        fx.repo.save_connection(conn.clone(), &fixed).unwrap();

        assert_eq!(fx.manager.check_connection_status(&conn, false).await, ConnectionStatus::Connected);
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 2);

        // bookkeeping writes are not edits
        fx.repo.add_favorite_directory(conn.id, "/roms/snes", None).unwrap();
        fx.manager.check_connection_status(&conn, false).await;
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deleted_connection_leaves_cache() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let other = add_connection(&fx.repo, "Other", "other.local");
        fx.manager
            .check_all_connection_statuses(&[conn.clone(), other.clone()], false)
            .await;

        fx.repo.delete_connection(conn.id).unwrap();
        assert!(fx.manager.status_of(conn.id).is_none());
        assert_eq!(fx.manager.status_of(other.id).unwrap().status, ConnectionStatus::Connected);

        // re-adding under the same id starts from scratch
        add_connection_with_id(&fx.repo, &conn);
        fx.manager.check_connection_status(&conn, false).await;
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_listing_persists_last_connected() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        fx.manager.list_directory("/roms", &conn).await.unwrap();
        let stored = fx.repo.get_connection(conn.id).unwrap();
        assert!(stored.last_connected_at.is_some());
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_crashed_check_can_be_retried() {
        let secrets = Arc::new(CrashingSecretStore::default());
        let fx = fixture_with_secrets(MockClient::default(), test_config(), secrets.clone());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");

        secrets.crash.store(true, Ordering::SeqCst);
        let report = fx.manager.check_connection(&conn, false).await;
        assert_eq!(report.status, ConnectionStatus::Error);
        assert_eq!(report.last_error.as_deref(), Some("Status check aborted"));
        assert_eq!(fx.manager.status_of(conn.id).unwrap().status, ConnectionStatus::Error);

        secrets.crash.store(false, Ordering::SeqCst);
        let report = fx.manager.check_connection(&conn, true).await;
        assert_eq!(report.status, ConnectionStatus::Connected);
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsaved_connection_check_skips_cache() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = Connection::new("New", "new.local", "deck", AuthMode::Password);
        let creds = password_credentials(&conn);

        fx.manager.test_connection_with_credentials(&conn, &creds).await.unwrap();
        assert_eq!(fx.client.test_calls.load(Ordering::SeqCst), 1);
        assert!(fx.manager.status_of(conn.id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_reports_progress() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let local = fx.dir.path().join("game.sfc");
        std::fs::write(&local, b"0123456789").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let outcome = fx
            .manager
            .upload_file(&local, "/roms/snes/game.sfc", &conn, &TransferControl::new(), move |p| {
                sink.lock().push(p)
            })
            .await
            .unwrap();

        assert_eq!(outcome, UploadOutcome::Completed { bytes_sent: 10 });
        let seen = seen.lock();
        assert_eq!(seen.first().unwrap().bytes_sent, 4);
        assert_eq!(*seen.last().unwrap(), TransferProgress { bytes_sent: 10, total_bytes: 10 });
        assert_eq!(fx.client.uploads.lock()[0].1, b"0123456789");
        assert!(!fx.manager.is_busy(conn.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_upload_releases_connection() {
        let fx = fixture(
            MockClient {
                chunk_delay: Duration::from_millis(20),
                ..Default::default()
            },
            test_config(),
        );
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let local = fx.dir.path().join("game.sfc");
        std::fs::write(&local, vec![7u8; 64]).unwrap();

        let control = TransferControl::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let upload = {
            let manager = fx.manager.clone();
            let control = control.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                manager
                    .upload_file(&local, "/roms/game.sfc", &conn, &control, move |p| {
                        let _ = tx.send(p);
                    })
                    .await
            })
        };

        rx.recv().await.unwrap();
        assert!(fx.manager.is_busy(conn.id));
        control.cancel();

        let outcome = upload.await.unwrap().unwrap();
        assert!(matches!(outcome, UploadOutcome::Cancelled { bytes_sent } if bytes_sent < 64));
        assert!(!fx.manager.is_busy(conn.id));
        assert!(fx.client.uploads.lock().is_empty());
        assert_eq!(fx.manager.status_of(conn.id).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_upload_future_cancels_transfer() {
        let fx = fixture(
            MockClient {
                chunk_delay: Duration::from_millis(20),
                ..Default::default()
            },
            test_config(),
        );
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let local = fx.dir.path().join("game.sfc");
        std::fs::write(&local, vec![7u8; 64]).unwrap();

        let control = TransferControl::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let upload = {
            let manager = fx.manager.clone();
            let control = control.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                manager
                    .upload_file(&local, "/roms/game.sfc", &conn, &control, move |p| {
                        let _ = tx.send(p);
                    })
                    .await
            })
        };

        rx.recv().await.unwrap();
        upload.abort();
        assert!(upload.await.unwrap_err().is_cancelled());
        assert!(control.is_cancelled());
        assert!(!fx.manager.is_busy(conn.id));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_paths_before_connecting() {
        let fx = fixture(MockClient::default(), test_config());
        let conn = add_connection(&fx.repo, "Deck", "deck.local");
        let local = fx.dir.path().join("game.sfc");
        std::fs::write(&local, b"rom").unwrap();
        let control = TransferControl::new();

        assert!(matches!(
            fx.manager.upload_file(&local, "roms/game.sfc", &conn, &control, |_| {}).await,
            Err(AppError::InvalidPath(_))
        ));
        assert!(matches!(
            fx.manager.upload_file(&local, "/roms/", &conn, &control, |_| {}).await,
            Err(AppError::InvalidPath(_))
        ));
        assert!(matches!(
            fx.manager
                .upload_file(&fx.dir.path().join("missing.sfc"), "/roms/x.sfc", &conn, &control, |_| {})
                .await,
            Err(AppError::LocalFile(_))
        ));
        assert!(fx.manager.status_of(conn.id).is_none());
    }
}
