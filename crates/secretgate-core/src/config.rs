//! Configuration parsing.
//!
//! The daemon reads a single TOML file. Every section is optional and every
//! field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [discovery]
//! directory = "/run/user/1000/secretgate/clients"
//! suffix = ".sock"
//!
//! [upstream]
//! address = "unix:path=/run/user/1000/bus"
//!
//! [approval]
//! enabled = true
//! timeout_secs = 300
//! gate_writes = false
//!
//! [tracker]
//! departed_retention_secs = 300
//!
//! [daemon]
//! operator_socket = "/run/user/1000/secretgate/operator.sock"
//! session_socket = "/run/user/1000/secretgate/session.sock"
//! local_peer_skip = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::DEFAULT_LOCAL_PEER_SKIP;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Endpoint discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Backend secret store connection.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Human approval policy.
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Client lifecycle tracking.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Local control sockets.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if:
    /// - `approval.timeout_secs` is zero
    /// - `discovery.suffix` is empty or contains a `/`
    /// - `tracker.departed_retention_secs` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.approval.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "approval.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.discovery.suffix.is_empty() || self.discovery.suffix.contains('/') {
            return Err(ConfigError::Validation(format!(
                "discovery.suffix must be a non-empty file suffix, got {:?}",
                self.discovery.suffix
            )));
        }
        if self.tracker.departed_retention_secs == 0 {
            return Err(ConfigError::Validation(
                "tracker.departed_retention_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Endpoint discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory watched for client endpoints.
    #[serde(default = "default_discovery_dir")]
    pub directory: PathBuf,

    /// File suffix identifying an endpoint.
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            directory: default_discovery_dir(),
            suffix: default_suffix(),
        }
    }
}

/// Backend connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Bus address of the backend store. `None` means the session bus.
    #[serde(default)]
    pub address: Option<String>,
}

/// Approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// When `false`, every request is approved without asking.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds to wait for a decision before timing out.
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,

    /// Also gate `CreateItem` and `SetSecret`.
    #[serde(default)]
    pub gate_writes: bool,
}

impl ApprovalConfig {
    /// Returns the approval timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_approval_timeout_secs(),
            gate_writes: false,
        }
    }
}

/// Client tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How long a departed sender is remembered.
    #[serde(default = "default_departed_retention_secs")]
    pub departed_retention_secs: u64,
}

impl TrackerConfig {
    /// Returns the departed-sender retention window.
    #[must_use]
    pub const fn departed_retention(&self) -> Duration {
        Duration::from_secs(self.departed_retention_secs)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            departed_retention_secs: default_departed_retention_secs(),
        }
    }
}

/// Local control socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Operator socket path (mode 0600).
    #[serde(default = "default_operator_socket")]
    pub operator_socket: PathBuf,

    /// Session socket path (mode 0660).
    #[serde(default = "default_session_socket")]
    pub session_socket: PathBuf,

    /// Ancestors skipped when attributing a local peer.
    #[serde(default = "default_local_peer_skip")]
    pub local_peer_skip: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            operator_socket: default_operator_socket(),
            session_socket: default_session_socket(),
            local_peer_skip: default_local_peer_skip(),
        }
    }
}

/// Returns `$XDG_RUNTIME_DIR/secretgate`, or `/tmp/secretgate` without it.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp/secretgate"),
        |dir| PathBuf::from(dir).join("secretgate"),
    )
}

fn default_discovery_dir() -> PathBuf {
    runtime_dir().join("clients")
}

fn default_suffix() -> String {
    ".sock".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_approval_timeout_secs() -> u64 {
    300
}

const fn default_departed_retention_secs() -> u64 {
    300
}

fn default_operator_socket() -> PathBuf {
    runtime_dir().join("operator.sock")
}

fn default_session_socket() -> PathBuf {
    runtime_dir().join("session.sock")
}

const fn default_local_peer_skip() -> usize {
    DEFAULT_LOCAL_PEER_SKIP
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
