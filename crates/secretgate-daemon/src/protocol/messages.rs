//! Messages carried on the operator and session sockets.
//!
//! Every message is a JSON object tagged by `"type"`:
//!
//! ```json
//! {"type":"decide","id":"7d1c...","approve":false,"reason":"not now"}
//! ```

use std::collections::BTreeMap;

use secretgate_core::approval::ApprovalRequest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::ClientInfo;
use crate::gateway::GatewayEvent;

/// Requests accepted on the operator socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorRequest {
    /// List requests waiting for a decision.
    ListPending,
    /// Resolve a pending request.
    Decide {
        /// Request id.
        id: Uuid,
        /// `true` to approve, `false` to deny.
        approve: bool,
        /// Deny reason; ignored when approving.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// List connected client endpoints.
    ListClients,
    /// Stream gateway events until the connection closes.
    Watch,
}

/// Replies on the operator socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorResponse {
    /// Reply to [`OperatorRequest::ListPending`].
    Pending {
        /// Pending requests, oldest first.
        requests: Vec<ApprovalRequest>,
    },
    /// Reply to [`OperatorRequest::Decide`].
    Decided {
        /// Request id.
        id: Uuid,
        /// `false` if the id was unknown or already resolved.
        resolved: bool,
    },
    /// Reply to [`OperatorRequest::ListClients`].
    Clients {
        /// Registered endpoints.
        clients: Vec<ClientInfo>,
    },
    /// One frame of an [`OperatorRequest::Watch`] stream.
    Event {
        /// The gateway event.
        event: GatewayEvent,
    },
    /// The request could not be served.
    Error {
        /// Description.
        message: String,
    },
}

/// Requests accepted on the session socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRequest {
    /// Ask for approval to create a commit signature.
    RequestSignature {
        /// Repository path or name.
        repository: String,
        /// Commit author.
        author: String,
        /// Commit committer.
        committer: String,
        /// First line of the commit message.
        subject: String,
        /// Any other context to show the approver.
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
}

/// Replies on the session socket.
///
/// Denials never carry the approver's reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionResponse {
    /// The request was approved.
    Approved,
    /// The request was denied, timed out, or cancelled.
    Denied,
    /// The request could not be served.
    Error {
        /// Description.
        message: String,
    },
}
