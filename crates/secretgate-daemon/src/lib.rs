//! secretgate-daemon - Secret Service approval proxy.
//!
//! Sandboxed clients reach the Secret Service through a per-client endpoint
//! socket. The daemon claims `org.freedesktop.secrets` on each endpoint,
//! forwards calls to the real store, and holds secret reads until a human
//! approves them on the operator socket.
//!
//! ```text
//!  client ─► <name>.sock ─► proxy ─┬─► backend store (session bus)
//!                                  └─► approval gateway ◄─ operator.sock
//! ```
//!
//! # Modules
//!
//! - [`secret`]: Secret Service names, the `Secret` struct, wire errors
//! - [`backend`]: the store behind the proxy ([`backend::SecretBackend`])
//! - [`memory`]: in-memory store for tests and local runs
//! - [`session`]: client to backend session path remapping
//! - [`tracker`]: per-sender cancellation on disconnect
//! - [`identity`]: requester identity resolution
//! - [`gateway`]: pending approvals and decisions
//! - [`proxy`]: per-endpoint routing, handlers, signal forwarding
//! - [`discovery`]: endpoint directory watching
//! - [`protocol`]: operator and session control sockets

pub mod backend;
pub mod discovery;
pub mod gateway;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod proxy;
pub mod secret;
pub mod session;
pub mod tracker;
