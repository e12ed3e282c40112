//! Error types for the local control sockets.
//!
//! # Security Considerations
//!
//! Credential failures are reported to the peer only as a closed connection.
//! The variants exist for local logging and caller branching.

use std::io;

use thiserror::Error;

/// Maximum frame payload in bytes (1 MiB).
///
/// Longer length prefixes are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors on the operator and session sockets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size the peer tried to send or receive.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer is not allowed on this socket.
    #[error("peer uid {uid} gid {gid} not authorized on the {socket} socket")]
    Unauthorized {
        /// Peer user ID.
        uid: u32,
        /// Peer group ID.
        gid: u32,
        /// Socket the peer connected to.
        socket: String,
    },

    /// The peer closed the connection mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload is not a valid message.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Returns `true` if the peer broke the protocol and must be dropped.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Serialization { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type for local socket operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_classification() {
        assert!(ProtocolError::frame_too_large(2 * MAX_FRAME_SIZE, MAX_FRAME_SIZE)
            .is_protocol_violation());
        assert!(!ProtocolError::ConnectionClosed.is_protocol_violation());

        let bad: ProtocolError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(bad.is_protocol_violation());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::Unauthorized {
            uid: 1001,
            gid: 1001,
            socket: "operator".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "peer uid 1001 gid 1001 not authorized on the operator socket"
        );
    }
}
