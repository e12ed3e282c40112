//! Approval gateway.
//!
//! The gateway is the one piece of state shared by every proxy instance: a
//! registry of requests waiting for a human decision. Handlers call
//! [`ApprovalGateway::require_approval`] and block; approval surfaces list
//! [`ApprovalGateway::pending`] requests and resolve them with
//! [`ApprovalGateway::decide`].
//!
//! ```text
//!  handler                       gateway                         operator
//!  -------                       -------                         --------
//!  require_approval ──insert──► pending[id] ──Requested event──► ListPending
//!        │                          │                                │
//!        │ wait: decision |         │ ◄──────────── decide(id) ──────┘
//!        │       timeout  |         │   remove + send under lock
//!        │       cancel   |         │
//!        ▼                          ▼
//!     Ok / Denied / TimedOut / Cancelled  ──Resolved event──►
//! ```
//!
//! # Invariants
//!
//! - A request is resolved exactly once. Whoever removes it from the
//!   registry owns the resolution; `decide` removes the entry and delivers
//!   the decision under the same lock, so a waiter that finds its entry
//!   already gone always finds the decision in its channel.
//! - The registry lock is never held across an await.
//! - Dropping a waiting future removes its entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secretgate_core::approval::{ApprovalDecision, ApprovalRequest, ItemInfo, RequestType};
use secretgate_core::config::ApprovalConfig;
use secretgate_core::identity::SenderInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time a request waits for a decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a request was not approved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    /// A human refused.
    #[error("request denied")]
    Denied {
        /// Reason given by the approver, if any.
        reason: Option<String>,
    },

    /// Nobody decided in time.
    #[error("approval timed out")]
    TimedOut,

    /// The requester went away or the daemon is shutting down.
    #[error("approval cancelled")]
    Cancelled,
}

/// Terminal state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Approved by a human, or by a disabled gateway.
    Approved,
    /// Denied by a human.
    Denied,
    /// Deadline passed.
    TimedOut,
    /// Requester disconnected or shutdown.
    Cancelled,
}

/// Registry change notification for approval surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A request entered the registry.
    Requested(Box<ApprovalRequest>),
    /// A request left the registry.
    Resolved {
        /// Request id.
        id: Uuid,
        /// How it ended.
        outcome: ApprovalOutcome,
    },
}

/// What a caller supplies to [`ApprovalGateway::require_approval`].
#[derive(Debug, Clone)]
pub struct ApprovalInput {
    /// Client endpoint name.
    pub client_name: String,
    /// Kind of access.
    pub request_type: RequestType,
    /// Items the request exposes.
    pub items: Vec<ItemInfo>,
    /// Client-visible session path.
    pub session: String,
    /// Extra context for the approver.
    pub extra_context: BTreeMap<String, String>,
    /// Requester identity.
    pub requester: SenderInfo,
}

impl ApprovalInput {
    /// Creates input with no items, session, or context.
    #[must_use]
    pub fn new(
        client_name: impl Into<String>,
        request_type: RequestType,
        requester: SenderInfo,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            request_type,
            items: Vec::new(),
            session: String::new(),
            extra_context: BTreeMap::new(),
            requester,
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
}

struct PendingEntry {
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

/// Concurrency-safe registry of pending approval requests.
pub struct ApprovalGateway {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    events: broadcast::Sender<GatewayEvent>,
    timeout: Duration,
    enabled: bool,
}

impl ApprovalGateway {
    /// Creates a gateway whose requests time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
            timeout,
            enabled: true,
        }
    }

    /// Creates a gateway that approves everything without asking.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(DEFAULT_APPROVAL_TIMEOUT)
        }
    }

    /// Creates a gateway from the `[approval]` configuration section.
    #[must_use]
    pub fn from_config(config: &ApprovalConfig) -> Self {
        if config.enabled {
            Self::new(config.timeout())
        } else {
            Self::disabled()
        }
    }

    /// Returns `false` for a gateway created with [`Self::disabled`].
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Time a request waits before timing out.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Registers a request and waits for its resolution.
    ///
    /// # Errors
    ///
    /// - [`ApprovalError::Denied`] if an approver refused.
    /// - [`ApprovalError::TimedOut`] if nobody decided before the deadline.
    /// - [`ApprovalError::Cancelled`] if `cancel` fired first.
    pub async fn require_approval(
        &self,
        cancel: &CancellationToken,
        input: ApprovalInput,
    ) -> Result<(), ApprovalError> {
        if !self.enabled {
            debug!(
                client = %input.client_name,
                request_type = %input.request_type,
                "approval disabled, allowing request"
            );
            return Ok(());
        }

        let request = ApprovalRequest::new(
            input.client_name,
            input.request_type,
            input.requester,
            self.timeout,
        )
        .with_items(input.items)
        .with_session(input.session)
        .with_extra_context(input.extra_context);
        let id = request.id;

        let (responder, mut decision_rx) = oneshot::channel();
        info!(request_id = %id, summary = %request.summary(), "approval requested");
        self.lock().insert(
            id,
            PendingEntry {
                request: request.clone(),
                responder,
            },
        );
        let guard = PendingGuard { gateway: self, id };
        self.notify(GatewayEvent::Requested(Box::new(request)));

        let interrupted = tokio::select! {
            biased;
            decision = &mut decision_rx => match decision {
                Ok(decision) => Ok(decision),
                Err(_) => Err(ApprovalError::Cancelled),
            },
            () = cancel.cancelled() => Err(ApprovalError::Cancelled),
            () = tokio::time::sleep(self.timeout) => Err(ApprovalError::TimedOut),
        };

        let decision = match interrupted {
            Ok(decision) => decision,
            Err(reason) => {
                if self.lock().remove(&id).is_some() {
                    drop(guard);
                    self.finish(id, &reason);
                    return Err(reason);
                }
                // decide() won the removal; its decision is already queued.
                match decision_rx.try_recv() {
                    Ok(decision) => decision,
                    Err(_) => {
                        self.finish(id, &reason);
                        return Err(reason);
                    },
                }
            },
        };
        drop(guard);

        match decision {
            ApprovalDecision::Approve => {
                info!(request_id = %id, "request approved");
                self.notify(GatewayEvent::Resolved {
                    id,
                    outcome: ApprovalOutcome::Approved,
                });
                Ok(())
            },
            ApprovalDecision::Deny { reason } => {
                let error = ApprovalError::Denied { reason };
                self.finish(id, &error);
                Err(error)
            },
        }
    }

    fn finish(&self, id: Uuid, error: &ApprovalError) {
        let outcome = match error {
            ApprovalError::Denied { .. } => ApprovalOutcome::Denied,
            ApprovalError::TimedOut => ApprovalOutcome::TimedOut,
            ApprovalError::Cancelled => ApprovalOutcome::Cancelled,
        };
        info!(request_id = %id, outcome = ?outcome, "request not approved");
        self.notify(GatewayEvent::Resolved { id, outcome });
    }

    /// Resolves a pending request.
    ///
    /// Returns `false` for unknown or already-resolved ids.
    pub fn decide(&self, id: Uuid, decision: ApprovalDecision) -> bool {
        let mut pending = self.lock();
        let Some(entry) = pending.remove(&id) else {
            debug!(request_id = %id, "decision for unknown or resolved request");
            return false;
        };
        if entry.responder.send(decision).is_err() {
            warn!(request_id = %id, "requester stopped waiting before the decision arrived");
        }
        true
    }

    /// Approves a pending request.
    pub fn approve(&self, id: Uuid) -> bool {
        self.decide(id, ApprovalDecision::Approve)
    }

    /// Denies a pending request.
    pub fn deny(&self, id: Uuid, reason: Option<String>) -> bool {
        self.decide(id, ApprovalDecision::Deny { reason })
    }

    /// Snapshot of pending requests, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .lock()
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Subscribes to registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Number of live event subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for ApprovalGateway {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

/// Removes a request whose waiter was dropped mid-wait.
struct PendingGuard<'a> {
    gateway: &'a ApprovalGateway,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.gateway.lock().remove(&self.id).is_some() {
            debug!(request_id = %self.id, "approval waiter dropped");
            self.gateway.notify(GatewayEvent::Resolved {
                id: self.id,
                outcome: ApprovalOutcome::Cancelled,
            });
        }
    }
}
