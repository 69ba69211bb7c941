//! SFTP protocol client.
//!
//! Every call opens its own session, does its work and drops the session. The
//! [`TransferClient`] trait is the seam the connection manager talks to; the
//! production implementation is [`Ssh2Client`] on top of libssh2.

pub mod progress;
pub mod transfer;

pub use progress::*;
pub use transfer::*;

use crate::config::Connection;
use crate::error::{AppError, AppResult};
use crate::keychain::{AuthSecret, Credentials};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session as Ssh2Session, Sftp};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub parent_path: String,
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
    /// `drwxr-xr-x` style
    pub permissions: Option<String>,
    /// Numeric uid
    pub owner: Option<u32>,
    /// Numeric gid
    pub group: Option<u32>,
}

/// Directories first, then case-insensitive by name
pub fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });
}

/// An upload in progress, as seen by a [`TransferClient`]
pub struct UploadJob<'a> {
    pub source: &'a mut dyn Read,
    pub total_bytes: u64,
    pub remote_path: &'a str,
    pub control: &'a TransferControl,
    /// Called after every chunk with `(bytes_sent, total_bytes)`
    pub progress: &'a mut dyn FnMut(u64, u64),
}

struct UploadJobMeta<'a> {
    total_bytes: u64,
    remote_path: &'a str,
    control: &'a TransferControl,
}

/// Copy `source` into `target` chunk by chunk, checking for cancellation
/// between chunks. An empty source still reports `(0, total)` once.
fn copy_chunks<W: Write>(
    source: &mut dyn Read,
    target: &mut W,
    job: UploadJobMeta<'_>,
    progress: &mut dyn FnMut(u64, u64),
    chunk_size: usize,
) -> AppResult<UploadOutcome> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes_sent = 0u64;
    loop {
        if job.control.is_cancelled() {
            return Ok(UploadOutcome::Cancelled { bytes_sent });
        }
        let n = match source.read(&mut buf) {
            Ok(0) => {
                if bytes_sent == 0 {
                    progress(0, job.total_bytes);
                }
                return Ok(UploadOutcome::Completed { bytes_sent });
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::LocalFile(format!("Failed to read upload source: {}", e))),
        };
        target
            .write_all(&buf[..n])
            .map_err(|e| map_io_error(e, job.remote_path))?;
        bytes_sent += n as u64;
        progress(bytes_sent, job.total_bytes);
    }
}

/// Stateless-per-call SFTP operations. Calls block; the manager runs them on
/// tokio's blocking pool.
pub trait TransferClient: Send + Sync + 'static {
    /// Authenticate and open the SFTP subsystem, then hang up
    fn test_connection(&self, connection: &Connection, credentials: &Credentials) -> AppResult<()>;

    fn list_directory(
        &self,
        connection: &Connection,
        credentials: &Credentials,
        path: &str,
    ) -> AppResult<Vec<DirectoryEntry>>;

    fn create_directory(&self, connection: &Connection, credentials: &Credentials, path: &str) -> AppResult<()>;

    /// Stream `job.source` to `job.remote_path`. A partially written remote file is
    /// removed when the upload fails or is cancelled.
    fn upload(&self, connection: &Connection, credentials: &Credentials, job: UploadJob<'_>)
        -> AppResult<UploadOutcome>;
}

// libssh2 session error codes (LIBSSH2_ERROR_*)
const SESSION_BANNER_RECV: i32 = -2;
const SESSION_BANNER_SEND: i32 = -3;
const SESSION_KEX_FAILURE: i32 = -5;
const SESSION_SOCKET_SEND: i32 = -7;
const SESSION_TIMEOUT: i32 = -9;
const SESSION_SOCKET_DISCONNECT: i32 = -13;
const SESSION_PASSWORD_EXPIRED: i32 = -15;
const SESSION_FILE: i32 = -16;
const SESSION_AUTHENTICATION_FAILED: i32 = -18;
const SESSION_PUBLICKEY_UNVERIFIED: i32 = -19;
const SESSION_SOCKET_TIMEOUT: i32 = -30;
const SESSION_SOCKET_RECV: i32 = -43;

// SFTP status codes (LIBSSH2_FX_*)
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_WRITE_PROTECT: i32 = 12;
const FX_NO_SPACE_ON_FILESYSTEM: i32 = 14;
const FX_QUOTA_EXCEEDED: i32 = 15;

/// Translate a libssh2 error into the crate's vocabulary.
/// `what` names the operation (and path, where there is one).
fn classify(code: ErrorCode, what: &str, message: &str) -> AppError {
    let detail = format!("{}: {}", what, message);
    match code {
        ErrorCode::Session(
            SESSION_AUTHENTICATION_FAILED | SESSION_PUBLICKEY_UNVERIFIED | SESSION_PASSWORD_EXPIRED | SESSION_FILE,
        ) => AppError::Auth(detail),
        ErrorCode::Session(SESSION_TIMEOUT | SESSION_SOCKET_TIMEOUT) => AppError::Timeout(detail),
        ErrorCode::Session(
            SESSION_BANNER_RECV
            | SESSION_BANNER_SEND
            | SESSION_KEX_FAILURE
            | SESSION_SOCKET_SEND
            | SESSION_SOCKET_DISCONNECT
            | SESSION_SOCKET_RECV,
        ) => AppError::Connection(detail),
        ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => AppError::PathNotFound(what.to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED | FX_WRITE_PROTECT) => AppError::PermissionDenied(detail),
        ErrorCode::SFTP(FX_NO_SPACE_ON_FILESYSTEM | FX_QUOTA_EXCEEDED) => AppError::RemoteStorageFull(detail),
        _ => AppError::Sftp(detail),
    }
}

fn map_ssh_error(err: ssh2::Error, what: &str) -> AppError {
    classify(err.code(), what, err.message())
}

/// Socket-level failures while streaming surface as io errors from ssh2's Read/Write impls
fn map_io_error(err: io::Error, what: &str) -> AppError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AppError::Timeout(format!("{}: {}", what, err)),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => AppError::Connection(format!("{}: {}", what, err)),
        io::ErrorKind::PermissionDenied => AppError::PermissionDenied(format!("{}: {}", what, err)),
        _ => AppError::Sftp(format!("{}: {}", what, err)),
    }
}

/// Production client on libssh2
#[derive(Debug, Clone)]
pub struct Ssh2Client {
    connect_timeout: Duration,
    io_timeout: Duration,
    chunk_size: usize,
}

impl Default for Ssh2Client {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60), 32 * 1024)
    }
}

impl Ssh2Client {
    pub fn new(connect_timeout: Duration, io_timeout: Duration, chunk_size: usize) -> Self {
        Self {
            connect_timeout,
            io_timeout,
            chunk_size: chunk_size.max(1024),
        }
    }

    pub fn from_settings(settings: &crate::config::TransferSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.connect_timeout_secs),
            Duration::from_secs(settings.io_timeout_secs),
            settings.upload_chunk_bytes,
        )
    }

    /// Connect, handshake, authenticate per auth mode and open the SFTP subsystem
    pub fn authenticate(&self, connection: &Connection, credentials: &Credentials) -> AppResult<SftpSession> {
        connection.validate()?;
        credentials.check_matches(connection)?;

        let tcp = self.connect_tcp(&connection.host, connection.port)?;
        let mut session = Ssh2Session::new().map_err(|e| map_ssh_error(e, "create session"))?;
        session.set_tcp_stream(tcp.try_clone()?);
        session.set_timeout(u32::try_from(self.io_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| map_ssh_error(e, "SSH handshake"))?;

        if let Some((key, _)) = session.host_key() {
            tracing::debug!(
                "Host key for {}: {}",
                connection.connection_string(),
                compute_sha256_fingerprint(key)
            );
        }

        let username = connection.username.as_str();
        match &credentials.secret {
            AuthSecret::Password { password } => {
                session
                    .userauth_password(username, password)
                    .map_err(|e| map_ssh_error(e, "password authentication"))?;
            }
            AuthSecret::Key { private_key, passphrase } => {
                authenticate_with_key(&session, username, private_key, passphrase.as_deref())?;
            }
            AuthSecret::PasswordWithKey {
                password,
                private_key,
                passphrase,
            } => {
                if let Err(key_err) = authenticate_with_key(&session, username, private_key, passphrase.as_deref()) {
                    tracing::debug!(
                        "Key rejected for {}, falling back to password: {}",
                        connection.connection_string(),
                        crate::logging::sanitize(&key_err.to_string())
                    );
                    session
                        .userauth_password(username, password)
                        .map_err(|e| map_ssh_error(e, "password authentication"))?;
                }
            }
        }

        if !session.authenticated() {
            return Err(AppError::Auth("Server did not accept credentials".to_string()));
        }

        let sftp = session.sftp().map_err(|e| map_ssh_error(e, "open SFTP subsystem"))?;
        Ok(SftpSession {
            sftp,
            _session: session,
            _tcp: tcp,
        })
    }

    fn connect_tcp(&self, host: &str, port: u16) -> AppResult<TcpStream> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| AppError::Connection(format!("Could not resolve {}: {}", host, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(self.io_timeout))?;
                    tcp.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(tcp);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => {
                AppError::Timeout(format!("Connecting to {}:{} timed out", host, port))
            }
            Some(e) => AppError::Connection(format!("Could not connect to {}:{}: {}", host, port, e)),
            None => AppError::Connection(format!("No addresses found for {}", host)),
        })
    }
}

/// libssh2 only takes key material from disk; the temp file lives for the duration of the call
fn authenticate_with_key(
    session: &Ssh2Session,
    username: &str,
    private_key: &str,
    passphrase: Option<&str>,
) -> AppResult<()> {
    let key_file_path = std::env::temp_dir().join(format!("rombridge_key_{}", uuid::Uuid::new_v4()));
    std::fs::write(&key_file_path, private_key)
        .map_err(|e| AppError::LocalFile(format!("Failed to write temp key file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_file_path, std::fs::Permissions::from_mode(0o600));
    }

    let result = session.userauth_pubkey_file(username, None, &key_file_path, passphrase);
    let _ = std::fs::remove_file(&key_file_path);

    result.map_err(|e| map_ssh_error(e, "key authentication"))
}

/// An authenticated SFTP channel. Dropping it closes the session.
pub struct SftpSession {
    sftp: Sftp,
    _session: Ssh2Session,
    _tcp: TcpStream,
}

impl SftpSession {
    pub fn list_dir(&self, path: &str) -> AppResult<Vec<DirectoryEntry>> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| map_ssh_error(e, path))?;

        let mut result = Vec::with_capacity(entries.len());
        for (file_path, stat) in entries {
            let name = file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }

            result.push(DirectoryEntry {
                name,
                parent_path: path.to_string(),
                path: file_path.to_string_lossy().to_string(),
                size: stat.size.unwrap_or(0),
                modified: stat.mtime.and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
                is_directory: stat.is_dir(),
                permissions: stat.perm.map(|_| format_permissions(&stat)),
                owner: stat.uid,
                group: stat.gid,
            });
        }

        sort_entries(&mut result);
        Ok(result)
    }

    pub fn mkdir(&self, path: &str) -> AppResult<()> {
        self.sftp
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| map_ssh_error(e, path))
    }

    pub fn upload(&self, job: UploadJob<'_>, chunk_size: usize) -> AppResult<UploadOutcome> {
        let UploadJob {
            source,
            total_bytes,
            remote_path,
            control,
            progress,
        } = job;

        if control.is_cancelled() {
            return Ok(UploadOutcome::Cancelled { bytes_sent: 0 });
        }

        let target = Path::new(remote_path);
        let mut file = self
            .sftp
            .open_mode(
                target,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(|e| map_ssh_error(e, remote_path))?;

        let result = copy_chunks(
            source,
            &mut file,
            UploadJobMeta {
                total_bytes,
                remote_path,
                control,
            },
            progress,
            chunk_size,
        );

        let result = result.and_then(|outcome| match outcome {
            UploadOutcome::Completed { .. } => file
                .fsync()
                .or_else(|e| match e.code() {
                    // Plenty of servers lack fsync@openssh.com
                    ErrorCode::SFTP(_) => Ok(()),
                    _ => Err(e),
                })
                .map(|_| outcome)
                .map_err(|e| map_ssh_error(e, remote_path)),
            cancelled => Ok(cancelled),
        });
        drop(file);

        if !matches!(result, Ok(UploadOutcome::Completed { .. })) {
            if let Err(e) = self.sftp.unlink(target) {
                tracing::warn!(
                    "Could not remove partial upload {}: {}",
                    crate::logging::sanitize(remote_path),
                    e
                );
            } else {
                tracing::debug!("Removed partial upload {}", crate::logging::sanitize(remote_path));
            }
        }

        result
    }
}

impl TransferClient for Ssh2Client {
    fn test_connection(&self, connection: &Connection, credentials: &Credentials) -> AppResult<()> {
        let session = self.authenticate(connection, credentials)?;
        // Touch the filesystem so a server with a broken SFTP subsystem fails here
        session
            .sftp
            .stat(Path::new(&connection.root_path))
            .map_err(|e| map_ssh_error(e, &connection.root_path))?;
        Ok(())
    }

    fn list_directory(
        &self,
        connection: &Connection,
        credentials: &Credentials,
        path: &str,
    ) -> AppResult<Vec<DirectoryEntry>> {
        self.authenticate(connection, credentials)?.list_dir(path)
    }

    fn create_directory(&self, connection: &Connection, credentials: &Credentials, path: &str) -> AppResult<()> {
        self.authenticate(connection, credentials)?.mkdir(path)
    }

    fn upload(
        &self,
        connection: &Connection,
        credentials: &Credentials,
        job: UploadJob<'_>,
    ) -> AppResult<UploadOutcome> {
        self.authenticate(connection, credentials)?.upload(job, self.chunk_size)
    }
}

/// `SHA256:<base64>` as printed by OpenSSH
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// Format file permissions as a string like "rwxr-xr-x"
fn format_permissions(stat: &FileStat) -> String {
    let kind = if stat.is_dir() {
        'd'
    } else if stat.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    s.push_str(&mode_string(stat.perm.unwrap_or(0)));
    s
}

fn mode_string(perms: u32) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    BITS.iter()
        .map(|&(bit, c)| if perms & bit != 0 { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_directory: bool) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            parent_path: "/roms".to_string(),
            path: format!("/roms/{}", name),
            size: 0,
            modified: None,
            is_directory,
            permissions: None,
            owner: None,
            group: None,
        }
    }

    #[test]
    fn test_sort_directories_first_case_insensitive() {
        let mut entries = vec![
            entry("zelda.sfc", false),
            entry("snes", true),
            entry("Mario.sfc", false),
            entry("NES", true),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["NES", "snes", "Mario.sfc", "zelda.sfc"]);
    }

    #[test]
    fn test_classify_error_codes() {
        assert!(matches!(
            classify(ErrorCode::Session(SESSION_AUTHENTICATION_FAILED), "auth", "denied"),
            AppError::Auth(_)
        ));
        assert!(matches!(
            classify(ErrorCode::Session(SESSION_TIMEOUT), "read", "timeout"),
            AppError::Timeout(_)
        ));
        assert!(matches!(
            classify(ErrorCode::Session(SESSION_SOCKET_DISCONNECT), "read", "gone"),
            AppError::Connection(_)
        ));
        assert!(matches!(
            classify(ErrorCode::SFTP(FX_NO_SUCH_FILE), "/roms/x", "no such file"),
            AppError::PathNotFound(p) if p == "/roms/x"
        ));
        assert!(matches!(
            classify(ErrorCode::SFTP(FX_PERMISSION_DENIED), "/", "denied"),
            AppError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify(ErrorCode::SFTP(FX_NO_SPACE_ON_FILESYSTEM), "/", "full"),
            AppError::RemoteStorageFull(_)
        ));
        assert!(matches!(classify(ErrorCode::SFTP(4), "/", "failure"), AppError::Sftp(_)));
    }

    #[test]
    fn test_io_error_mapping() {
        let err = map_io_error(io::Error::new(io::ErrorKind::TimedOut, "slow"), "/roms/a");
        assert!(err.is_connectivity());
        let err = map_io_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"), "/roms/a");
        assert!(matches!(err, AppError::Connection(_)));
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(0o755), "rwxr-xr-x");
        assert_eq!(mode_string(0o640), "rw-r-----");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"ssh-ed25519 AAAA");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_empty_source_reports_progress_once() {
        let control = TransferControl::new();
        let mut seen = Vec::new();
        let mut target = Vec::new();
        let outcome = copy_chunks(
            &mut io::empty(),
            &mut target,
            UploadJobMeta {
                total_bytes: 0,
                remote_path: "/roms/empty.sfc",
                control: &control,
            },
            &mut |sent, total| seen.push((sent, total)),
            4,
        )
        .unwrap();

        assert_eq!(outcome, UploadOutcome::Completed { bytes_sent: 0 });
        assert_eq!(seen, vec![(0, 0)]);
        assert!(target.is_empty());
    }

    #[test]
    fn test_copy_chunks_reports_each_chunk_and_stops_on_cancel() {
        let control = TransferControl::new();
        let mut seen = Vec::new();
        let mut target = Vec::new();
        let outcome = copy_chunks(
            &mut &b"0123456789"[..],
            &mut target,
            UploadJobMeta {
                total_bytes: 10,
                remote_path: "/roms/game.sfc",
                control: &control,
            },
            &mut |sent, total| seen.push((sent, total)),
            4,
        )
        .unwrap();
        assert_eq!(outcome, UploadOutcome::Completed { bytes_sent: 10 });
        assert_eq!(seen, vec![(4, 10), (8, 10), (10, 10)]);
        assert_eq!(target, b"0123456789");

        control.cancel();
        let outcome = copy_chunks(
            &mut &b"0123456789"[..],
            &mut Vec::new(),
            UploadJobMeta {
                total_bytes: 10,
                remote_path: "/roms/game.sfc",
                control: &control,
            },
            &mut |_, _| {},
            4,
        )
        .unwrap();
        assert_eq!(outcome, UploadOutcome::Cancelled { bytes_sent: 0 });
    }
}
