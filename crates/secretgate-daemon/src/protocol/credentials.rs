//! Peer credentials of a local socket connection (`SO_PEERCRED`).

use std::io;

use tokio::net::UnixStream;

/// Kernel-reported identity of the process on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective user ID of the peer.
    pub uid: u32,
    /// Effective group ID of the peer.
    pub gid: u32,
    /// Process ID of the peer, if the platform reports one.
    pub pid: Option<u32>,
}

impl PeerCredentials {
    /// Reads the credentials of the peer connected to `stream`.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if `SO_PEERCRED` cannot be read.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_reports_own_credentials() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = PeerCredentials::from_stream(&a).unwrap();

        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid, nix::unistd::getgid().as_raw());
        assert_eq!(creds.pid, Some(std::process::id()));
    }
}
