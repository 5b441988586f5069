//! State-change event bus
//!
//! Publish/subscribe with bounded per-subscriber queues. The subscriber
//! list is an immutable snapshot swapped on add/remove, so publishers
//! iterate without holding a lock across sends. Delivery is non-blocking:
//! a full subscriber queue drops the event and bumps that subscription's
//! drop counter. Per-subscriber delivery preserves publication order; no
//! ordering is guaranteed across subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::service::{HealthState, ServiceKind, ServiceState};

/// Default per-subscription queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A service state-change event
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    /// Service label
    pub label: String,
    /// Service kind
    #[serde(rename = "serviceType")]
    pub kind: ServiceKind,
    /// State before the transition
    #[serde(rename = "oldState")]
    pub old_state: ServiceState,
    /// State after the transition
    #[serde(rename = "newState")]
    pub new_state: ServiceState,
    /// Health at publication time
    pub health: HealthState,
    /// Failure description when the transition was caused by an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Publication timestamp
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    /// Whether this event is a real state edge (health refreshes republish
    /// with `old_state == new_state`)
    #[must_use]
    pub fn is_transition(&self) -> bool {
        self.old_state != self.new_state
    }
}

/// Subscription filter
///
/// An empty filter matches everything; label and kind constraints compose
/// conjunctively.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    labels: Option<Vec<String>>,
    kinds: Option<Vec<ServiceKind>>,
}

impl EventFilter {
    /// Match every event
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a set of labels
    #[must_use]
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: Some(labels.into_iter().map(Into::into).collect()),
            kinds: None,
        }
    }

    /// Restrict to one service kind
    #[must_use]
    pub fn kind(kind: ServiceKind) -> Self {
        Self {
            labels: None,
            kinds: Some(vec![kind]),
        }
    }

    /// Additionally restrict to a kind
    #[must_use]
    pub fn and_kind(mut self, kind: ServiceKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Whether an event passes this filter
    #[must_use]
    pub fn matches(&self, event: &StateChange) -> bool {
        if let Some(labels) = &self.labels {
            if !labels.iter().any(|l| l == &event.label) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

struct SubEntry {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<StateChange>,
    dropped: AtomicU64,
    cancelled: AtomicBool,
}

/// Fan-out bus for [`StateChange`] events
pub struct EventBus {
    subs: RwLock<Arc<Vec<Arc<SubEntry>>>>,
    next_id: AtomicU64,
    default_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default queue capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom default queue capacity
    #[must_use]
    pub fn with_capacity(default_capacity: usize) -> Self {
        Self {
            subs: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Subscribe with the bus default queue capacity
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.default_capacity)
    }

    /// Subscribe with an explicit queue capacity
    pub fn subscribe_with_capacity(
        self: &Arc<Self>,
        filter: EventFilter,
        capacity: usize,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let entry = Arc::new(SubEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            tx,
            dropped: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        });

        let mut subs = self.subs.write();
        let mut next: Vec<Arc<SubEntry>> = subs.as_ref().clone();
        next.push(Arc::clone(&entry));
        *subs = Arc::new(next);

        Subscription {
            rx,
            entry,
            bus: Arc::clone(self),
        }
    }

    /// Publish an event to every matching, live subscriber
    ///
    /// Never blocks: full queues drop the event and count it.
    pub fn publish(&self, event: &StateChange) {
        let snapshot = Arc::clone(&self.subs.read());

        for sub in snapshot.iter() {
            if sub.cancelled.load(Ordering::Acquire) || !sub.filter.matches(event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(
                        subscription = sub.id,
                        dropped,
                        label = %event.label,
                        "Subscriber queue full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver gone without cancel; next swap removes it.
                    sub.cancelled.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Current subscription count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subs
            .read()
            .iter()
            .filter(|s| !s.cancelled.load(Ordering::Acquire))
            .count()
    }

    fn remove(&self, id: u64) {
        let mut subs = self.subs.write();
        let next: Vec<Arc<SubEntry>> =
            subs.iter().filter(|s| s.id != id).cloned().collect();
        *subs = Arc::new(next);
    }
}

/// A live subscription
///
/// Dropping the subscription cancels it. Cancelling only stops future
/// deliveries; events already buffered stay drainable via [`Subscription::recv`].
pub struct Subscription {
    rx: mpsc::Receiver<StateChange>,
    entry: Arc<SubEntry>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Receive the next event, or `None` once cancelled and drained
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// Events dropped because this subscription's queue was full
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.entry.dropped.load(Ordering::Relaxed)
    }

    /// Stop future deliveries
    ///
    /// Safe to call from any context; the publisher is never re-entered.
    /// Buffered events remain receivable until drained.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
        self.bus.remove(self.entry.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Build a [`StateChange`] stamped now
#[must_use]
pub fn state_change(
    label: &str,
    kind: ServiceKind,
    old_state: ServiceState,
    new_state: ServiceState,
    health: HealthState,
    error: Option<String>,
) -> StateChange {
    StateChange {
        label: label.to_string(),
        kind,
        old_state,
        new_state,
        health,
        error,
        timestamp: Utc::now(),
    }
}
