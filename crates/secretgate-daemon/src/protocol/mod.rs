//! Local control sockets.
//!
//! Two Unix sockets let humans and local tools talk to the daemon:
//!
//! - **Operator socket** (`operator.sock`, mode 0600): lists and decides
//!   pending approvals, lists clients, streams gateway events.
//! - **Session socket** (`session.sock`, mode 0660): local tools ask for
//!   approval of a commit signature.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        JSON messages (tag "type")        │  messages
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  4-byte BE length prefix
//! ├─────────────────────────────────────────┤
//! │     UDS transport + SO_PEERCRED check    │  socket_manager, credentials
//! └─────────────────────────────────────────┘
//! ```
//!
//! - Maximum frame size: 1 MiB, checked before the payload is buffered.
//!
//! # Security Considerations
//!
//! - Peer credentials are verified at accept time: the operator socket only
//!   admits the daemon's own uid, the session socket also admits its gid.
//! - Sockets are created with restrictive permissions in a 0700 directory.
//! - Stale socket files are removed only if they really are sockets.

pub mod connection;
pub mod connection_handler;
pub mod credentials;
pub mod error;
pub mod messages;
pub mod socket_manager;

pub use connection::{Connection, ConnectionPermit};
pub use connection_handler::{handle_connection, serve, ControlContext, LOCAL_CLIENT_NAME};
pub use credentials::PeerCredentials;
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use messages::{OperatorRequest, OperatorResponse, SessionRequest, SessionResponse};
pub use socket_manager::{SocketManager, SocketManagerConfig, SocketType};
