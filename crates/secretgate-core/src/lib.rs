//! secretgate-core - transport-free building blocks for the secretgate proxy.
//!
//! Nothing in this crate talks to a bus, opens a socket, or needs a runtime.
//! The daemon crate wires these pieces to D-Bus and tokio.
//!
//! # Modules
//!
//! - [`path`]: Secret Service object path classification
//! - [`escape`]: `_xy` object path segment escaping (systemd unit paths)
//! - [`process`]: process-chain walking and invoker strategies
//! - [`identity`]: requester identity
//! - [`approval`]: approval request and decision types
//! - [`config`]: TOML configuration

pub mod approval;
pub mod config;
pub mod escape;
pub mod identity;
pub mod path;
pub mod process;

pub use approval::{ApprovalDecision, ApprovalRequest, ItemInfo, RequestType};
pub use config::{ConfigError, GatewayConfig};
pub use identity::SenderInfo;
pub use process::{
    BusSenderStrategy, InvokerStrategy, LocalPeerStrategy, ProcessInfo, ProcessSource,
    ProcfsSource,
};
