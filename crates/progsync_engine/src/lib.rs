//! # progsync Engine
//!
//! Offline-first sync engine for progsync.
//!
//! This crate provides:
//! - A durable operation queue (Pending → Completed | Failed | ManualResolution)
//! - A connectivity oracle with cached verdicts and lightweight probes
//! - A priority retry scheduler with backoff and per-tag circuit breakers
//! - The sync engine that drains the queue to the remote authority
//! - Seams for transport, authentication, conflict application, and events
//!
//! ## Architecture
//!
//! Every local mutation is recorded in the [`OperationQueue`] first, so
//! recording never depends on the network. The [`SyncEngine`] drains the
//! queue in passes:
//! 1. Check reachability and the session
//! 2. Split Pending operations into progress, custom, and settings channels
//! 3. Send each channel, merging conflicts with the field-level resolver
//! 4. Persist a retry for anything that may succeed later
//!
//! ## Key Invariants
//!
//! - Only one pass runs at a time
//! - An operation leaves Pending at most once
//! - Conflicts never surface as caller errors
//! - Persistence failures are never swallowed
//! - A persisted retry runs once, whether its timer or a restart finds it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod auth;
mod breaker;
mod clock;
mod config;
mod connectivity;
mod engine;
mod error;
mod ledger;
mod notify;
mod queue;
mod remote;
mod scheduler;
mod transport;

pub use applier::{ConflictApplier, MemoryApplier};
pub use auth::{AuthProvider, NoAuth, StaticAuth};
pub use breaker::{CircuitBreakerState, CircuitBreakers};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BreakerConfig, ConnectivityConfig, Endpoints, RetryConfig, SchedulerConfig, SyncConfig,
};
pub use connectivity::{ConnectivityOracle, ConnectivityState};
pub use engine::{
    ForceSyncResult, PassOutcome, SyncEngine, SyncEngineBuilder, SyncReport, SyncStatus, PASS_TAG,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use ledger::{PersistedRetry, RetryLedger};
pub use notify::{
    NotificationHub, NotificationSink, RecordingSink, Subscribers, Subscription, SyncEvent,
};
pub use queue::{OperationQueue, OperationStatus, QueueStats, QueuedOperation};
pub use remote::RemoteApi;
pub use scheduler::{ForceSyncReport, Priority, RetryScheduler, ScheduleOptions, SyncTask, TaskFuture};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, MockTransport, Transport};
