//! Sync events and subscriber registries.

use parking_lot::Mutex;
use progsync_protocol::{Channel, OperationKind};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Something the UI may want to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// A pass started.
    SyncStarted {
        /// Operations the pass will attempt.
        pending_count: usize,
    },
    /// A pass finished.
    SyncCompleted {
        /// Operations accepted by the remote.
        synced_count: usize,
        /// Operations that failed permanently.
        failed_count: usize,
        /// Operations still pending afterwards.
        still_pending_count: usize,
    },
    /// The user must sign in before syncing can continue.
    AuthRequired {
        /// Operations that have never been attempted.
        pending_count: usize,
    },
    /// An operation failed permanently.
    OperationFailed {
        /// Operation id.
        operation_id: String,
        /// Operation kind.
        kind: OperationKind,
        /// Failure reason.
        error: String,
        /// Attempts made.
        retry_count: u32,
    },
    /// A conflict needs a human.
    ManualResolutionRequired {
        /// Operation id.
        operation_id: String,
        /// Entity in conflict.
        entity_id: String,
        /// Description of the differing fields.
        message: String,
    },
    /// A conflict was merged automatically.
    ConflictResolved {
        /// Operation id.
        operation_id: String,
        /// Entity in conflict.
        entity_id: String,
        /// Channel the entity belongs to.
        channel: Channel,
    },
    /// The device went online or offline.
    ConnectivityChanged {
        /// New state.
        online: bool,
    },
}

impl SyncEvent {
    /// Returns a stable name for the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted { .. } => "sync-started",
            SyncEvent::SyncCompleted { .. } => "sync-completed",
            SyncEvent::AuthRequired { .. } => "auth-required",
            SyncEvent::OperationFailed { .. } => "operation-failed",
            SyncEvent::ManualResolutionRequired { .. } => "manual-resolution-required",
            SyncEvent::ConflictResolved { .. } => "conflict-resolved",
            SyncEvent::ConnectivityChanged { .. } => "connectivity-changed",
        }
    }
}

/// Receives sync events. Delivery is best effort and must not block.
pub trait NotificationSink: Send + Sync {
    /// Handles one event.
    fn notify(&self, event: &SyncEvent);
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<E>)>>,
}

/// A list of callbacks.
///
/// Callbacks run in subscription order. A callback that panics is logged
/// and skipped; the rest still run.
pub struct Subscribers<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Subscribers<E> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the number of live subscriptions.
    pub fn len(&self) -> usize {
        self.registry.entries.lock().len()
    }

    /// Returns true if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Subscribers<E> {
    /// Adds a callback.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.lock().push((id, Arc::new(callback)));

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.entries.lock().retain(|(entry, _)| *entry != id);
                }
            }),
        }
    }

    /// Runs every callback with `event`.
    pub fn emit(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<Callback<E>> = self
            .registry
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("subscriber panicked; continuing with the rest");
            }
        }
    }
}

/// Handle returned by a subscription. Call [`Subscription::unsubscribe`] to
/// stop receiving callbacks; dropping the handle keeps the subscription.
pub struct Subscription {
    remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Removes the callback.
    pub fn unsubscribe(self) {
        (self.remove)();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A [`NotificationSink`] that fans events out to subscribers.
#[derive(Default)]
pub struct NotificationHub {
    subscribers: Subscribers<SyncEvent>,
}

impl NotificationHub {
    /// Creates a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every event.
    pub fn subscribe(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(callback)
    }
}

impl NotificationSink for NotificationHub {
    fn notify(&self, event: &SyncEvent) {
        tracing::debug!(event = event.event_type(), "publishing sync event");
        self.subscribers.emit(event);
    }
}

/// A sink that records every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event received so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Returns the events of one type.
    pub fn events_of(&self, event_type: &str) -> Vec<SyncEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}
