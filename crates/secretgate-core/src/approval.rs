//! Approval request data model.
//!
//! An [`ApprovalRequest`] is a snapshot of everything a human needs to decide
//! whether to release secret material: who is asking, which items, and why.
//! The registry that owns pending requests lives in the daemon; this module
//! only carries the data shared with approval surfaces.
//!
//! # Lifecycle
//!
//! ```text
//!              +--> Approved
//!              |
//! Pending -----+--> Denied
//!              |
//!              +--> TimedOut
//!              |
//!              +--> Cancelled
//! ```
//!
//! Exactly one terminal state is reached, and the request leaves the pending
//! registry on that transition.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::SenderInfo;

/// What the requester wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Read one or more secret values.
    GetSecret,
    /// Enumerate items matching attributes.
    Search,
    /// Create or overwrite an item.
    Write,
    /// Sign a commit.
    Sign,
}

impl RequestType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetSecret => "get_secret",
            Self::Search => "search",
            Self::Write => "write",
            Self::Sign => "sign",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a stored item, fetched right before asking for approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    /// Item object path.
    pub path: String,
    /// Item label.
    pub label: String,
    /// Lookup attributes.
    pub attributes: BTreeMap<String, String>,
}

impl ItemInfo {
    /// Creates metadata with only the path known.
    #[must_use]
    pub fn unlabelled(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// A pending request for human approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request id.
    pub id: Uuid,
    /// Name of the client endpoint the request arrived on.
    pub client_name: String,
    /// Items the request would expose.
    pub items: Vec<ItemInfo>,
    /// Client-visible session path, if any.
    pub session: String,
    /// Kind of access requested.
    pub request_type: RequestType,
    /// Free-form context shown to the approver (search attributes, commit
    /// subject, and so on).
    pub extra_context: BTreeMap<String, String>,
    /// Who is asking.
    pub requester: SenderInfo,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request times out.
    pub deadline: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Creates a request with a fresh id that expires `timeout` from now.
    #[must_use]
    pub fn new(
        client_name: impl Into<String>,
        request_type: RequestType,
        requester: SenderInfo,
        timeout: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|delta| created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: Uuid::new_v4(),
            client_name: client_name.into(),
            items: Vec::new(),
            session: String::new(),
            request_type,
            extra_context: BTreeMap::new(),
            requester,
            created_at,
            deadline,
        }
    }

    /// Sets the items.
    #[must_use]
    pub fn with_items(mut self, items: Vec<ItemInfo>) -> Self {
        self.items = items;
        self
    }

    /// Sets the session path.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Sets the extra context.
    #[must_use]
    pub fn with_extra_context(mut self, extra_context: BTreeMap<String, String>) -> Self {
        self.extra_context = extra_context;
        self
    }

    /// Returns `true` if the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// One-line description for logs and notifications.
    #[must_use]
    pub fn summary(&self) -> String {
        let target = match self.items.as_slice() {
            [] => String::from("no items"),
            [item] if !item.label.is_empty() => format!("'{}'", item.label),
            [item] => item.path.clone(),
            items => format!("{} items", items.len()),
        };
        format!(
            "{} wants {} on {} via {}",
            self.requester.display_name(),
            self.request_type,
            target,
            self.client_name
        )
    }
}

/// A human decision on a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Release the material.
    Approve,
    /// Refuse, with an optional reason kept on the daemon side.
    Deny {
        /// Why the request was denied.
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    /// Returns `true` for [`ApprovalDecision::Approve`].
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }
}
