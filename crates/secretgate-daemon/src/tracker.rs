//! Client lifecycle tracking.
//!
//! A gated call may wait minutes for a human. If the client that made it
//! disconnects meanwhile, the wait must end. The tracker hands each requester
//! a cancellable context and cancels it when the bus reports the requester's
//! unique name as gone.
//!
//! ```text
//!   daemon root ─► proxy token ─► sender context (":1.42") ─► require_approval
//!                                         ▲
//!   NameOwnerChanged(":1.42", old, "") ───┘ cancel
//! ```
//!
//! # Disconnect-before-tracked race
//!
//! A client can send a call and disconnect before the handler registers a
//! context for it. The disconnect then finds nothing to cancel, and the
//! handler later registers a context nobody will ever cancel. Unique bus
//! names are never reused, so the tracker remembers departed senders for a
//! bounded window; a context requested for a departed sender is born
//! cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zbus::names::BusName;
use zbus::Connection;

/// Default departed-sender retention.
pub const DEFAULT_DEPARTED_RETENTION: Duration = Duration::from_secs(300);

/// Maximum remembered departed senders; the oldest are evicted first.
pub const MAX_DEPARTED_SENDERS: usize = 4096;

/// A registered per-sender context.
///
/// Released with [`ClientTracker::release`], which only deregisters the entry
/// if no newer context replaced it.
#[derive(Debug, Clone)]
pub struct SenderContext {
    sender: String,
    generation: u64,
    token: CancellationToken,
}

impl SenderContext {
    /// Token cancelled when the sender disconnects or is superseded.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The sender this context belongs to.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }
}

#[derive(Debug)]
struct ActiveEntry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<String, ActiveEntry>,
    departed: HashMap<String, Instant>,
    departed_order: VecDeque<(String, Instant)>,
}

impl TrackerState {
    fn prune_departed(&mut self, now: Instant, retention: Duration) {
        while let Some((sender, at)) = self.departed_order.front() {
            if now.duration_since(*at) < retention {
                break;
            }
            // Only drop the map entry if it still refers to this record.
            if self.departed.get(sender) == Some(at) {
                self.departed.remove(sender);
            }
            self.departed_order.pop_front();
        }
    }

    fn remember_departed(&mut self, sender: &str, now: Instant) {
        self.departed.insert(sender.to_string(), now);
        self.departed_order.push_back((sender.to_string(), now));
        while self.departed.len() > MAX_DEPARTED_SENDERS {
            let Some((oldest, at)) = self.departed_order.pop_front() else {
                break;
            };
            if self.departed.get(&oldest) == Some(&at) {
                self.departed.remove(&oldest);
            }
        }
    }
}

/// Tracks cancellable request contexts per bus sender.
#[derive(Debug)]
pub struct ClientTracker {
    state: RwLock<TrackerState>,
    retention: Duration,
    next_generation: AtomicU64,
}

impl ClientTracker {
    /// Creates a tracker with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_DEPARTED_RETENTION)
    }

    /// Creates a tracker that remembers departed senders for `retention`.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            retention,
            next_generation: AtomicU64::new(1),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh context for `sender`, derived from `parent`.
    ///
    /// Any earlier context for the same sender is cancelled. If the sender
    /// has already disconnected, the returned context is already cancelled.
    pub fn context_for_sender(&self, parent: &CancellationToken, sender: &str) -> SenderContext {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.write();
        state.prune_departed(now, self.retention);

        if state.departed.contains_key(sender) {
            debug!(sender = %sender, "context requested for departed sender");
            let token = CancellationToken::new();
            token.cancel();
            return SenderContext {
                sender: sender.to_string(),
                generation,
                token,
            };
        }

        let token = parent.child_token();
        let previous = state.active.insert(
            sender.to_string(),
            ActiveEntry {
                generation,
                token: token.clone(),
            },
        );
        drop(state);

        if let Some(previous) = previous {
            debug!(sender = %sender, "superseding earlier request context");
            previous.token.cancel();
        }
        SenderContext {
            sender: sender.to_string(),
            generation,
            token,
        }
    }

    /// Cancels and deregisters whatever context `sender` has. Idempotent.
    pub fn remove(&self, sender: &str) {
        let removed = self.write().active.remove(sender);
        if let Some(entry) = removed {
            entry.token.cancel();
        }
    }

    /// Deregisters `context` if it is still the sender's current one.
    pub fn release(&self, context: &SenderContext) {
        let mut state = self.write();
        let current = state
            .active
            .get(&context.sender)
            .is_some_and(|entry| entry.generation == context.generation);
        if current {
            state.active.remove(&context.sender);
        }
        drop(state);
        context.token.cancel();
    }

    /// Records that `sender` left the bus and cancels its context.
    pub fn sender_disconnected(&self, sender: &str) {
        let now = Instant::now();
        let mut state = self.write();
        state.prune_departed(now, self.retention);
        let removed = state.active.remove(sender);
        state.remember_departed(sender, now);
        drop(state);

        if let Some(entry) = removed {
            debug!(sender = %sender, "cancelling request context of departed sender");
            entry.token.cancel();
        }
    }

    /// Returns `true` if `sender` has a registered context.
    #[must_use]
    pub fn is_tracked(&self, sender: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .contains_key(sender)
    }

    /// Number of registered contexts.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .len()
    }

    /// Number of remembered departed senders.
    #[must_use]
    pub fn departed_count(&self) -> usize {
        let mut state = self.write();
        state.prune_departed(Instant::now(), self.retention);
        state.departed.len()
    }
}

impl Default for ClientTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds `NameOwnerChanged` disconnects on `connection` into `tracker`.
///
/// Runs until `cancel` fires or the signal stream ends. Returns at once on
/// a peer-to-peer connection, which has no bus to report owner changes.
pub async fn watch_disconnects(
    tracker: Arc<ClientTracker>,
    connection: Connection,
    cancel: CancellationToken,
) -> zbus::Result<()> {
    if !connection.is_bus() {
        debug!("not a bus connection, no disconnects to watch");
        return Ok(());
    }
    let dbus = zbus::fdo::DBusProxy::new(&connection).await?;
    let mut changes = dbus.receive_name_owner_changed().await?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            signal = changes.next() => {
                let Some(signal) = signal else {
                    debug!("NameOwnerChanged stream ended");
                    return Ok(());
                };
                let args = match signal.args() {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(error = %e, "malformed NameOwnerChanged signal");
                        continue;
                    },
                };
                if let BusName::Unique(name) = args.name() {
                    if args.new_owner().is_none() {
                        tracker.sender_disconnected(name.as_str());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_child_of_parent() {
        let tracker = ClientTracker::new();
        let parent = CancellationToken::new();
        let ctx = tracker.context_for_sender(&parent, ":1.5");

        assert!(tracker.is_tracked(":1.5"));
        assert!(!ctx.token().is_cancelled());
        parent.cancel();
        assert!(ctx.token().is_cancelled());
    }

    #[test]
    fn test_new_context_cancels_previous() {
        let tracker = ClientTracker::new();
        let parent = CancellationToken::new();
        let first = tracker.context_for_sender(&parent, ":1.5");
        let second = tracker.context_for_sender(&parent, ":1.5");

        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());

        // Releasing the superseded context leaves the newer one registered.
        tracker.release(&first);
        assert!(tracker.is_tracked(":1.5"));
        assert!(!second.token().is_cancelled());

        tracker.release(&second);
        assert!(!tracker.is_tracked(":1.5"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tracker = ClientTracker::new();
        let ctx = tracker.context_for_sender(&CancellationToken::new(), ":1.5");
        tracker.remove(":1.5");
        tracker.remove(":1.5");
        tracker.remove(":1.404");
        assert!(ctx.token().is_cancelled());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_disconnect_cancels_only_that_sender() {
        let tracker = ClientTracker::new();
        let parent = CancellationToken::new();
        let a = tracker.context_for_sender(&parent, ":1.5");
        let b = tracker.context_for_sender(&parent, ":1.6");

        tracker.sender_disconnected(":1.5");
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    /// Without a departed record, a disconnect that arrives before the
    /// context is registered is lost.
    #[test]
    fn test_disconnect_before_tracked_is_lost_without_departed_record() {
        let tracker = ClientTracker::with_retention(Duration::ZERO);
        tracker.sender_disconnected(":1.9");

        let ctx = tracker.context_for_sender(&CancellationToken::new(), ":1.9");
        assert!(!ctx.token().is_cancelled());
    }

    #[test]
    fn test_disconnect_before_tracked_yields_cancelled_context() {
        let tracker = ClientTracker::new();
        tracker.sender_disconnected(":1.9");

        let ctx = tracker.context_for_sender(&CancellationToken::new(), ":1.9");
        assert!(ctx.token().is_cancelled());
        assert!(!tracker.is_tracked(":1.9"));
    }

    #[test]
    fn test_departed_set_is_bounded() {
        let tracker = ClientTracker::new();
        for i in 0..(MAX_DEPARTED_SENDERS + 10) {
            tracker.sender_disconnected(&format!(":1.{i}"));
        }
        assert_eq!(tracker.departed_count(), MAX_DEPARTED_SENDERS);

        // The oldest were evicted, the newest are remembered.
        let oldest = tracker.context_for_sender(&CancellationToken::new(), ":1.0");
        assert!(!oldest.token().is_cancelled());
        let newest = tracker.context_for_sender(
            &CancellationToken::new(),
            &format!(":1.{}", MAX_DEPARTED_SENDERS + 9),
        );
        assert!(newest.token().is_cancelled());
    }

    #[test]
    fn test_departed_entries_expire() {
        let tracker = ClientTracker::with_retention(Duration::from_millis(20));
        tracker.sender_disconnected(":1.3");
        assert_eq!(tracker.departed_count(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(tracker.departed_count(), 0);
    }
}
