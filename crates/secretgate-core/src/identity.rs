//! Requester identity.

use serde::{Deserialize, Serialize};

use crate::process::ProcessInfo;

/// Best-effort description of who sent a request.
///
/// Every field may be zero or empty when the corresponding lookup failed.
/// For bus senders, `pid` and `process_name` describe the resolved invoker
/// rather than the raw connection owner whenever a process chain was read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Unique bus name (`:1.42`), or a synthetic `local:<pid>` for local peers.
    pub sender_id: String,
    /// Process ID of the invoker.
    pub pid: u32,
    /// User ID of the connection owner.
    pub uid: u32,
    /// Command name of the invoker.
    pub process_name: String,
    /// systemd unit owning the process, if resolved that way.
    pub unit_name: String,
    /// Chain from the connection owner toward the root.
    pub process_chain: Vec<ProcessInfo>,
}

impl SenderInfo {
    /// Creates an identity carrying only the sender id.
    #[must_use]
    pub fn unresolved(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            ..Self::default()
        }
    }

    /// Human-readable label for prompts and logs.
    ///
    /// Prefers the process name, then the unit name, then the sender id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if !self.process_name.is_empty() {
            &self.process_name
        } else if !self.unit_name.is_empty() {
            &self.unit_name
        } else {
            &self.sender_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_preference() {
        let mut info = SenderInfo::unresolved(":1.7");
        assert_eq!(info.display_name(), ":1.7");

        info.unit_name = "ssh.service".to_string();
        assert_eq!(info.display_name(), "ssh.service");

        info.process_name = "claude".to_string();
        assert_eq!(info.display_name(), "claude");
    }
}
