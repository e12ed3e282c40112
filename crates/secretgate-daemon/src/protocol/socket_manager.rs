//! Operator and session control sockets.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   SocketManager                      │
//! │  ┌──────────────────┐      ┌──────────────────┐      │
//! │  │  operator.sock   │      │  session.sock    │      │
//! │  │  (mode 0600)     │      │  (mode 0660)     │      │
//! │  │  uid must match  │      │  uid or gid      │      │
//! │  └────────┬─────────┘      └────────┬─────────┘      │
//! │           └────────────┬────────────┘                │
//! │                        ▼                             │
//! │            (Connection, SocketType)                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The operator socket is the approval surface: it lists and resolves
//! pending requests. The session socket lets local tools (a commit-signing
//! shim, for example) ask for approval themselves.
//!
//! # Security Considerations
//!
//! - Socket permissions are set right after binding.
//! - A missing parent directory is created with mode 0700. Existing
//!   directories keep their permissions, and symlinked directories are refused.
//! - Stale socket files are removed before binding; other file types are not.
//! - Peer credentials are compared in constant time.
//! - The socket type comes from which listener accepted, never from the peer.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secretgate_core::config::DaemonConfig;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionPermit};
use super::credentials::PeerCredentials;
use super::error::{ProtocolError, ProtocolResult};

/// Maximum concurrent connections across both sockets.
const MAX_CONNECTIONS: usize = 64;

/// Operator socket mode (owner read/write).
const OPERATOR_SOCKET_MODE: u32 = 0o600;

/// Session socket mode (owner and group read/write).
const SESSION_SOCKET_MODE: u32 = 0o660;

/// Mode of socket directories created here.
const DIRECTORY_MODE: u32 = 0o700;

/// Which socket a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Approval surface; may list and decide requests.
    Operator,
    /// Local tools asking for approval.
    Session,
}

impl SocketType {
    /// Returns `true` if this socket may resolve requests.
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Operator)
    }
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator => write!(f, "operator"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Socket paths and limits.
#[derive(Debug, Clone)]
pub struct SocketManagerConfig {
    /// Operator socket path.
    pub operator_socket_path: PathBuf,
    /// Session socket path.
    pub session_socket_path: PathBuf,
    /// Maximum concurrent connections across both sockets.
    pub max_connections: usize,
}

impl SocketManagerConfig {
    /// Creates a config for the given paths.
    #[must_use]
    pub fn new(
        operator_socket_path: impl Into<PathBuf>,
        session_socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            operator_socket_path: operator_socket_path.into(),
            session_socket_path: session_socket_path.into(),
            max_connections: MAX_CONNECTIONS,
        }
    }

    /// Takes the paths from the `[daemon]` config section.
    #[must_use]
    pub fn from_daemon_config(config: &DaemonConfig) -> Self {
        Self::new(&config.operator_socket, &config.session_socket)
    }

    /// Sets the connection limit.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Owns both listeners and removes their files on drop.
pub struct SocketManager {
    config: SocketManagerConfig,
    operator_listener: UnixListener,
    session_listener: UnixListener,
    connection_sem: Arc<Semaphore>,
}

impl SocketManager {
    /// Creates the directories, removes stale sockets, binds both sockets and
    /// sets their modes.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created or is a symlink, a non-socket
    /// file sits at a socket path, binding fails, or permissions cannot be set.
    pub fn bind(config: SocketManagerConfig) -> ProtocolResult<Self> {
        if let Some(parent) = config.operator_socket_path.parent() {
            Self::ensure_directory(parent)?;
        }
        if let Some(parent) = config.session_socket_path.parent() {
            if config.session_socket_path.parent() != config.operator_socket_path.parent() {
                Self::ensure_directory(parent)?;
            }
        }

        Self::cleanup_socket(&config.operator_socket_path)?;
        Self::cleanup_socket(&config.session_socket_path)?;

        let operator_listener = Self::bind_one(
            &config.operator_socket_path,
            SocketType::Operator,
            OPERATOR_SOCKET_MODE,
        )?;
        let session_listener = Self::bind_one(
            &config.session_socket_path,
            SocketType::Session,
            SESSION_SOCKET_MODE,
        )?;

        info!(
            operator_socket = %config.operator_socket_path.display(),
            session_socket = %config.session_socket_path.display(),
            max_connections = config.max_connections,
            "control sockets bound"
        );

        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            config,
            operator_listener,
            session_listener,
        })
    }

    fn bind_one(path: &Path, socket_type: SocketType, mode: u32) -> ProtocolResult<UnixListener> {
        let listener = UnixListener::bind(path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to bind {socket_type} socket to {}: {e}", path.display()),
            ))
        })?;
        Self::set_permissions(path, mode)?;
        Ok(listener)
    }

    /// Creates `path` with mode 0700 if missing.
    ///
    /// Existing directories are used as they are; symlinks are refused.
    fn ensure_directory(path: &Path) -> ProtocolResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "{} is a symlink, refusing to use it as a socket directory",
                            path.display()
                        ),
                    )));
                }
                if !metadata.is_dir() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists but is not a directory", path.display()),
                    )));
                }
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path).map_err(|e| {
                    ProtocolError::Io(io::Error::new(
                        e.kind(),
                        format!("failed to create directory {}: {e}", path.display()),
                    ))
                })?;
                Self::set_permissions(path, DIRECTORY_MODE)
            },
            Err(e) => Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            ))),
        }
    }

    fn set_permissions(path: &Path, mode: u32) -> ProtocolResult<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to set permissions on {}: {e}", path.display()),
            ))
        })
    }

    /// Removes a leftover socket file at `path`.
    fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
        use std::os::unix::fs::FileTypeExt;

        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to stat {}: {e}", path.display()),
                )));
            },
        };
        if !metadata.file_type().is_socket() {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("path {} exists but is not a socket", path.display()),
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to remove stale socket {}: {e}", path.display()),
            ))
        })?;
        debug!(path = %path.display(), "removed stale socket file");
        Ok(())
    }

    /// Accepts the next authorized connection from either socket.
    ///
    /// # Errors
    ///
    /// Fails on accept errors and on peers that fail the credential check.
    /// Either way the listener stays usable.
    pub async fn accept(&self) -> ProtocolResult<(Connection, ConnectionPermit, SocketType)> {
        let permit = self.acquire().await?;

        let (stream, socket_type) = tokio::select! {
            result = self.operator_listener.accept() => {
                let (stream, _addr) = result?;
                (stream, SocketType::Operator)
            }
            result = self.session_listener.accept() => {
                let (stream, _addr) = result?;
                (stream, SocketType::Session)
            }
        };

        let (connection, permit) =
            Self::validate_and_create_connection(stream, permit, socket_type)?;
        Ok((connection, permit, socket_type))
    }

    async fn acquire(&self) -> ProtocolResult<OwnedSemaphorePermit> {
        self.connection_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Io(io::Error::other("connection semaphore closed")))
    }

    fn validate_and_create_connection(
        stream: UnixStream,
        permit: OwnedSemaphorePermit,
        socket_type: SocketType,
    ) -> ProtocolResult<(Connection, ConnectionPermit)> {
        use nix::unistd::{getgid, getuid};

        let creds = PeerCredentials::from_stream(&stream).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("failed to read peer credentials: {e}"),
            ))
        })?;

        if !is_authorized(&creds, socket_type, getuid().as_raw(), getgid().as_raw()) {
            return Err(ProtocolError::Unauthorized {
                uid: creds.uid,
                gid: creds.gid,
                socket: socket_type.to_string(),
            });
        }

        debug!(
            uid = creds.uid,
            gid = creds.gid,
            pid = ?creds.pid,
            socket_type = %socket_type,
            "accepted control connection"
        );
        Ok((
            Connection::new_with_credentials(stream, Some(creds)),
            ConnectionPermit::new(permit),
        ))
    }

    /// Operator socket path.
    #[must_use]
    pub fn operator_socket_path(&self) -> &Path {
        &self.config.operator_socket_path
    }

    /// Session socket path.
    #[must_use]
    pub fn session_socket_path(&self) -> &Path {
        &self.config.session_socket_path
    }

    /// Removes both socket files.
    pub fn cleanup(&self) -> ProtocolResult<()> {
        let mut errors = Vec::new();
        for path in [
            &self.config.operator_socket_path,
            &self.config.session_socket_path,
        ] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(socket_path = %path.display(), "removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => errors.push(format!("failed to remove {}: {e}", path.display())),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Io(io::Error::other(errors.join("; "))))
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("failed to clean up control sockets: {e}");
        }
    }
}

/// Operator peers need the daemon's UID; session peers its UID or GID.
fn is_authorized(creds: &PeerCredentials, socket_type: SocketType, uid: u32, gid: u32) -> bool {
    use subtle::ConstantTimeEq;

    let uid_match = creds.uid.to_ne_bytes().ct_eq(&uid.to_ne_bytes()).unwrap_u8() == 1;
    match socket_type {
        SocketType::Operator => uid_match,
        SocketType::Session => {
            let gid_match = creds.gid.to_ne_bytes().ct_eq(&gid.to_ne_bytes()).unwrap_u8() == 1;
            uid_match || gid_match
        },
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
        (
            dir.path().join("operator.sock"),
            dir.path().join("session.sock"),
        )
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn test_bind_sets_modes_and_cleanup_removes() {
        let tmp = TempDir::new().unwrap();
        let (operator_path, session_path) = paths(&tmp);
        let manager = SocketManager::bind(SocketManagerConfig::new(&operator_path, &session_path))
            .unwrap();

        assert_eq!(mode(&operator_path), OPERATOR_SOCKET_MODE);
        assert_eq!(mode(&session_path), SESSION_SOCKET_MODE);
        assert_eq!(manager.operator_socket_path(), operator_path);

        manager.cleanup().unwrap();
        assert!(!operator_path.exists());
        assert!(!session_path.exists());
    }

    #[tokio::test]
    async fn test_stale_sockets_replaced() {
        let tmp = TempDir::new().unwrap();
        let (operator_path, session_path) = paths(&tmp);
        let first = SocketManager::bind(SocketManagerConfig::new(&operator_path, &session_path))
            .unwrap();
        std::mem::forget(first);

        let second = SocketManager::bind(SocketManagerConfig::new(&operator_path, &session_path));
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_regular_file_not_clobbered() {
        let tmp = TempDir::new().unwrap();
        let (operator_path, session_path) = paths(&tmp);
        std::fs::write(&operator_path, b"keep me").unwrap();

        let config = SocketManagerConfig::new(&operator_path, &session_path);
        assert!(SocketManager::bind(config).is_err());
        assert_eq!(std::fs::read(&operator_path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_created_directory_is_private_existing_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let fresh = tmp.path().join("fresh");
        let _manager = SocketManager::bind(SocketManagerConfig::new(
            fresh.join("operator.sock"),
            fresh.join("session.sock"),
        ))
        .unwrap();
        assert_eq!(mode(&fresh), DIRECTORY_MODE);

        let shared = tmp.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();
        let _other = SocketManager::bind(SocketManagerConfig::new(
            shared.join("operator.sock"),
            shared.join("session.sock"),
        ))
        .unwrap();
        assert_eq!(mode(&shared), 0o755);
    }

    #[tokio::test]
    async fn test_symlinked_directory_refused() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let result = SocketManager::bind(SocketManagerConfig::new(
            link.join("operator.sock"),
            link.join("session.sock"),
        ));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_accept_routes_by_socket_type() {
        let tmp = TempDir::new().unwrap();
        let (operator_path, session_path) = paths(&tmp);
        let manager = Arc::new(
            SocketManager::bind(SocketManagerConfig::new(&operator_path, &session_path)).unwrap(),
        );

        for (path, expected) in [
            (&operator_path, SocketType::Operator),
            (&session_path, SocketType::Session),
        ] {
            let accepting = Arc::clone(&manager);
            let handle = tokio::spawn(async move { accepting.accept().await.unwrap() });
            let _client = UnixStream::connect(path).await.unwrap();
            let (conn, _permit, socket_type) = handle.await.unwrap();
            assert_eq!(socket_type, expected);
            assert_eq!(conn.credentials().map(|c| c.uid), Some(getuid_raw()));
        }
    }

    fn getuid_raw() -> u32 {
        nix::unistd::getuid().as_raw()
    }

    #[test]
    fn test_authorization_rules() {
        let peer = |uid, gid| PeerCredentials {
            uid,
            gid,
            pid: Some(1),
        };

        assert!(is_authorized(&peer(1000, 1000), SocketType::Operator, 1000, 1000));
        assert!(!is_authorized(&peer(1001, 1000), SocketType::Operator, 1000, 1000));

        assert!(is_authorized(&peer(1001, 1000), SocketType::Session, 1000, 1000));
        assert!(is_authorized(&peer(1000, 5), SocketType::Session, 1000, 1000));
        assert!(!is_authorized(&peer(1001, 5), SocketType::Session, 1000, 1000));
    }

    #[test]
    fn test_socket_type_privilege() {
        assert!(SocketType::Operator.is_privileged());
        assert!(!SocketType::Session.is_privileged());
        assert_eq!(SocketType::Session.to_string(), "session");
    }
}
