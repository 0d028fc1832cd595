//! The sync engine.
//!
//! A pass drains the Pending operations of the queue through three
//! independent channels:
//!
//! 1. **progress**: repeated edits of the same kind on the same problem are
//!    collapsed to the newest, then sent as one batch. Conflicts are merged
//!    field by field and the merged record is written back.
//! 2. **custom**: custom problems are created one at a time; conflicts are
//!    last-write-wins.
//! 3. **settings**: every queued settings change is folded into one map and
//!    written once; conflicts are last-write-wins.
//!
//! Failures that may succeed later get a persisted retry record and an
//! in-memory timer. Whichever fires first claims the record and runs the
//! retry.

use crate::applier::{ConflictApplier, MemoryApplier};
use crate::auth::{AuthProvider, NoAuth};
use crate::breaker::{CircuitBreakerState, CircuitBreakers};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConnectivityConfig, SchedulerConfig, SyncConfig};
use crate::connectivity::ConnectivityOracle;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::ledger::{PersistedRetry, RetryLedger};
use crate::notify::{NotificationHub, NotificationSink, Subscription, SyncEvent};
use crate::queue::{OperationQueue, OperationStatus, QueueStats, QueuedOperation};
use crate::remote::RemoteApi;
use crate::scheduler::{Priority, RetryScheduler, ScheduleOptions};
use crate::transport::Transport;
use parking_lot::Mutex;
use progsync_protocol::{
    decode_json, describe_conflict, requires_manual_resolution, resolve_custom_conflict,
    resolve_progress_conflict, resolve_settings_conflict, Channel, CustomProblemRecord, DedupeKey,
    Operation, OperationKind, ProgressEntry, ProgressRecord, Resolution, SettingsRecord, Timestamp,
};
use progsync_storage::KvStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scheduler tag of sync passes.
pub const PASS_TAG: &str = "sync-pass";

/// Snapshot of the engine for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Operations waiting to be sent.
    pub pending_count: usize,
    /// Whether a pass is running.
    pub is_syncing: bool,
    /// When the last pass finished.
    pub last_sync_at: Option<Timestamp>,
    /// Record counts per status.
    pub stats: QueueStats,
}

/// Outcome of [`SyncEngine::force_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForceSyncResult {
    /// Whether the pass ran to completion.
    pub success: bool,
    /// Operations accepted by the remote.
    pub synced: usize,
    /// Operations that failed permanently.
    pub failed: usize,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassOutcome {
    /// Every channel was attempted.
    Completed,
    /// Nothing was eligible.
    NothingPending,
    /// Another pass was already running.
    AlreadyRunning,
    /// The remote was unreachable.
    Offline,
    /// The session was rejected.
    AuthRequired,
    /// The pass was cancelled.
    Cancelled,
    /// The pass ran out of time.
    TimedOut,
}

impl PassOutcome {
    /// Returns true if the pass attempted its operations.
    pub fn ran(&self) -> bool {
        matches!(self, PassOutcome::Completed | PassOutcome::TimedOut)
    }
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// How the pass ended.
    pub outcome: PassOutcome,
    /// Operations accepted by the remote.
    pub synced: usize,
    /// Operations that failed permanently.
    pub failed: usize,
    /// Operations still Pending afterwards.
    pub still_pending: usize,
    /// Wall time spent.
    #[serde(skip)]
    pub duration: Duration,
}

impl SyncReport {
    fn skipped(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            synced: 0,
            failed: 0,
            still_pending: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Connectivity,
    Requested,
    Enqueued,
    Periodic,
    FollowUp,
    Retry,
}

impl Trigger {
    fn priority(self) -> Priority {
        match self {
            Trigger::Connectivity | Trigger::Requested => Priority::High,
            Trigger::Startup
            | Trigger::Enqueued
            | Trigger::Periodic
            | Trigger::FollowUp
            | Trigger::Retry => Priority::Normal,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    synced: usize,
    failed: usize,
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    triggers: mpsc::UnboundedSender<Trigger>,
    connectivity: Subscription,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    applier: Arc<dyn ConflictApplier>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    scheduler: SchedulerConfig,
    connectivity: ConnectivityConfig,
}

impl SyncEngineBuilder {
    /// Starts a builder with no authentication, an in-memory applier, and
    /// the system clock.
    pub fn new(store: Arc<dyn KvStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            auth: Arc::new(NoAuth),
            applier: Arc::new(MemoryApplier::new()),
            sink: Arc::new(NotificationHub::new()),
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }

    /// Sets the credential provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Sets where resolved conflict data is written.
    pub fn with_applier(mut self, applier: Arc<dyn ConflictApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Sets where events go.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the clock used for logical timestamps and retry records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the scheduler configuration.
    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Sets the connectivity configuration.
    pub fn with_connectivity_config(mut self, config: ConnectivityConfig) -> Self {
        self.connectivity = config;
        self
    }

    /// Opens the queue and wires everything together.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be opened.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let queue = OperationQueue::open_with_device_id(
            self.store.clone(),
            self.clock.clone(),
            self.config.device_id.clone(),
        )?;
        let ledger = RetryLedger::new(self.store);
        let remote = RemoteApi::new(
            self.transport.clone(),
            self.auth.clone(),
            &self.config,
            queue.device_id(),
        );

        let oracle = Arc::new(ConnectivityOracle::new(self.transport, self.connectivity));
        let sink = self.sink.clone();
        let connectivity_events = oracle.on_change(move |online| {
            sink.notify(&SyncEvent::ConnectivityChanged { online });
        });

        // The pass deadline governs sync-pass tasks.
        let mut scheduler_config = self.scheduler;
        if scheduler_config.task_timeout < self.config.pass_timeout {
            scheduler_config = scheduler_config.with_task_timeout(self.config.pass_timeout);
        }
        let scheduler = RetryScheduler::with_connectivity(scheduler_config, oracle.clone());
        let breakers = CircuitBreakers::new(self.config.breaker.clone());

        tracing::info!(device_id = %queue.device_id(), "sync engine ready");
        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                queue,
                ledger,
                remote,
                auth: self.auth,
                oracle,
                connectivity_events: Some(connectivity_events),
                scheduler,
                applier: self.applier,
                sink: self.sink,
                clock: self.clock,
                breakers,
                syncing: AtomicBool::new(false),
                last_sync_at: Mutex::new(None),
                pass_cancel: Mutex::new(CancellationToken::new()),
                timers: Mutex::new(HashMap::new()),
                driver: Mutex::new(None),
            }),
        })
    }
}

/// Drives queued operations to the remote authority.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.inner.queue.device_id())
            .field("is_syncing", &self.inner.syncing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Starts a builder.
    pub fn builder(store: Arc<dyn KvStore>, transport: Arc<dyn Transport>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(store, transport)
    }

    /// Returns this device's id.
    pub fn device_id(&self) -> &str {
        self.inner.queue.device_id()
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    /// Returns the connectivity oracle, for feeding it OS network signals.
    pub fn connectivity(&self) -> &Arc<ConnectivityOracle> {
        &self.inner.oracle
    }

    /// Records an operation. Never fails for network reasons.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed payload and `Persistence` if the
    /// record cannot be committed.
    pub fn enqueue(&self, operation: Operation, dedupe: Option<DedupeKey>) -> SyncResult<String> {
        let id = self.inner.queue.enqueue(operation, dedupe)?;
        self.inner.trigger(Trigger::Enqueued);
        Ok(id)
    }

    /// Records several operations in order.
    ///
    /// # Errors
    ///
    /// Stops at the first operation that cannot be recorded.
    pub fn enqueue_batch<I>(&self, items: I) -> SyncResult<Vec<String>>
    where
        I: IntoIterator<Item = (Operation, Option<DedupeKey>)>,
    {
        let ids = self.inner.queue.enqueue_batch(items)?;
        if !ids.is_empty() {
            self.inner.trigger(Trigger::Enqueued);
        }
        Ok(ids)
    }

    /// Returns a status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let stats = self.inner.queue.stats()?;
        Ok(SyncStatus {
            pending_count: stats.pending,
            is_syncing: self.inner.syncing.load(Ordering::SeqCst),
            last_sync_at: *self.inner.last_sync_at.lock(),
            stats,
        })
    }

    /// Returns the operations with a status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn operations(&self, status: OperationStatus) -> SyncResult<Vec<QueuedOperation>> {
        self.inner.queue.list_by_status(status)
    }

    /// Returns every persisted retry, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn pending_retries(&self) -> SyncResult<Vec<PersistedRetry>> {
        self.inner.ledger.all()
    }

    /// Returns a snapshot of a channel's circuit breaker.
    pub fn breaker_state(&self, channel: Channel) -> CircuitBreakerState {
        self.inner.breakers.state(channel.tag())
    }

    /// Runs one pass now. Operations waiting for a scheduled retry are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the queue fails mid-pass.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.inner.run_pass(false).await
    }

    /// Runs one pass now over every Pending operation, including those
    /// waiting for a retry. Returns `success: false` if a pass was already
    /// running or the pass could not start.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the queue fails mid-pass.
    pub async fn force_sync(&self) -> SyncResult<ForceSyncResult> {
        let report = self.inner.run_pass(true).await?;
        Ok(ForceSyncResult {
            success: matches!(
                report.outcome,
                PassOutcome::Completed | PassOutcome::NothingPending
            ),
            synced: report.synced,
            failed: report.failed,
        })
    }

    /// Asks the background driver for a pass soon. Returns false if the
    /// driver is not running.
    pub fn request_sync(&self) -> bool {
        self.inner.trigger(Trigger::Requested)
    }

    /// Cancels the running pass. In-flight requests are aborted and their
    /// operations stay Pending.
    pub fn cancel(&self) {
        self.inner.pass_cancel.lock().cancel();
    }

    /// Cancels the running pass, disarms retry timers, closes the circuit
    /// breakers, and deletes every queued operation and retry record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn clear_all(&self) -> SyncResult<()> {
        self.cancel();
        self.inner.disarm_all();
        self.inner.scheduler.cancel_by_tag(PASS_TAG);
        self.inner.breakers.reset_all();
        self.inner.queue.clear_all()?;
        self.inner.ledger.clear()?;
        tracing::info!("cleared sync queue");
        Ok(())
    }

    /// Picks up retries persisted by an earlier run. Due records are
    /// claimed and a pass runs for them; future records get timers.
    /// Returns how many due records were claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or queue fails.
    pub async fn resume_persisted_retries(&self) -> SyncResult<usize> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut claimed = 0;
        for record in inner.ledger.due(now)? {
            if inner.ledger.claim(&record)? {
                claimed += 1;
            }
        }
        for record in inner.ledger.waiting(now)? {
            inner.arm_timer(record);
        }

        if claimed > 0 {
            tracing::info!(claimed, "resuming persisted retries");
            if !inner.trigger(Trigger::Retry) {
                inner.run_pass(false).await?;
            }
        }
        Ok(claimed)
    }

    /// Starts the background driver: passes on connectivity recovery, on
    /// enqueue, on a period, as follow-ups, and when retries fall due.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut driver = inner.driver.lock();
        if driver.is_some() {
            return;
        }

        let (triggers, mut received) = mpsc::unbounded_channel();
        let connectivity = {
            let triggers = triggers.clone();
            inner.oracle.on_change(move |online| {
                if online {
                    let _ = triggers.send(Trigger::Connectivity);
                }
            })
        };

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let weak = Arc::downgrade(inner);
        let period = inner.config.periodic_interval;
        let handle = tokio::spawn(async move {
            let mut periodic = period.map(|period| {
                tokio::time::interval_at(tokio::time::Instant::now() + period, period)
            });
            loop {
                let trigger = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = received.recv() => match next {
                        Some(trigger) => trigger,
                        None => break,
                    },
                    _ = next_tick(&mut periodic) => Trigger::Periodic,
                };
                let Some(inner) = weak.upgrade() else { break };
                inner.schedule_pass(trigger);
            }
            tracing::debug!("sync driver stopped");
        });

        let _ = triggers.send(Trigger::Startup);
        inner.scheduler.start();
        *driver = Some(Driver {
            cancel,
            handle,
            triggers,
            connectivity,
        });
        tracing::info!("sync engine started");
    }

    /// Stops the driver, the scheduler, the running pass, and every retry
    /// timer. Persisted retries survive for the next start.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if let Some(driver) = inner.driver.lock().take() {
            driver.connectivity.unsubscribe();
            driver.cancel.cancel();
            driver.handle.abort();
        }
        inner.scheduler.shutdown();
        inner.pass_cancel.lock().cancel();
        inner.disarm_all();
        inner.oracle.shutdown();
        tracing::info!("sync engine stopped");
    }
}

async fn next_tick(periodic: &mut Option<tokio::time::Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

struct EngineInner {
    config: SyncConfig,
    queue: OperationQueue,
    ledger: RetryLedger,
    remote: RemoteApi,
    auth: Arc<dyn AuthProvider>,
    oracle: Arc<ConnectivityOracle>,
    /// Forwards oracle transitions to the sink while the engine lives.
    connectivity_events: Option<Subscription>,
    scheduler: RetryScheduler,
    applier: Arc<dyn ConflictApplier>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    breakers: CircuitBreakers,
    syncing: AtomicBool,
    last_sync_at: Mutex<Option<Timestamp>>,
    pass_cancel: Mutex<CancellationToken>,
    timers: Mutex<HashMap<String, (String, JoinHandle<()>)>>,
    driver: Mutex<Option<Driver>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // The oracle can outlive the engine through `connectivity()`.
        if let Some(subscription) = self.connectivity_events.take() {
            subscription.unsubscribe();
        }
    }
}

impl EngineInner {
    fn emit(&self, event: SyncEvent) {
        tracing::debug!(event = event.event_type(), "sync event");
        self.sink.notify(&event);
    }

    /// Sends a trigger to the driver. Returns false if it is not running.
    fn trigger(&self, trigger: Trigger) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|driver| driver.triggers.send(trigger).is_ok())
    }

    fn schedule_pass(self: &Arc<Self>, trigger: Trigger) {
        let priority = trigger.priority();
        if self.scheduler.has_queued(PASS_TAG) {
            if priority != Priority::High {
                tracing::trace!(?trigger, "sync pass already queued");
                return;
            }
            self.scheduler.cancel_by_tag(PASS_TAG);
        }

        let weak = Arc::downgrade(self);
        self.scheduler.schedule(
            PASS_TAG,
            move || {
                let weak: Weak<EngineInner> = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.run_pass(false).await.map(drop),
                        None => Ok(()),
                    }
                }
            },
            ScheduleOptions::new(priority).with_max_retries(0),
        );
        tracing::debug!(?trigger, ?priority, "queued sync pass");
    }

    async fn run_pass(self: &Arc<Self>, forced: bool) -> SyncResult<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync pass already running");
            return Ok(SyncReport::skipped(PassOutcome::AlreadyRunning));
        }
        let _guard = PassGuard(&self.syncing);

        let started = Instant::now();
        let cancel = CancellationToken::new();
        *self.pass_cancel.lock() = cancel.clone();

        let tally = Mutex::new(Tally::default());
        let outcome = match tokio::time::timeout(
            self.config.pass_timeout,
            self.pass_body(forced, &cancel, &tally),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout = ?self.config.pass_timeout, "sync pass timed out");
                PassOutcome::TimedOut
            }
        };

        let Tally { synced, failed } = std::mem::take(&mut *tally.lock());
        let mut report = SyncReport {
            outcome,
            synced,
            failed,
            still_pending: 0,
            duration: started.elapsed(),
        };
        if !outcome.ran() {
            return Ok(report);
        }

        report.still_pending = self.queue.pending_count()?;
        *self.last_sync_at.lock() = Some(self.clock.now());
        self.emit(SyncEvent::SyncCompleted {
            synced_count: synced,
            failed_count: failed,
            still_pending_count: report.still_pending,
        });
        tracing::info!(
            synced,
            failed,
            still_pending = report.still_pending,
            duration_ms = report.duration.as_millis() as u64,
            "sync pass finished"
        );

        if !self.eligible_pending()?.is_empty() {
            self.schedule_follow_up();
        }
        Ok(report)
    }

    /// Pending operations without a retry scheduled in the future.
    fn eligible_pending(&self) -> SyncResult<Vec<QueuedOperation>> {
        let waiting: HashSet<String> = self
            .ledger
            .waiting(self.clock.now())?
            .into_iter()
            .map(|record| record.operation_id)
            .collect();
        let mut pending = self.queue.list_pending()?;
        pending.retain(|op| !waiting.contains(&op.id));
        Ok(pending)
    }

    fn schedule_follow_up(self: &Arc<Self>) {
        if self.driver.lock().is_none() {
            return;
        }
        let delay = self.config.follow_up_delay;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.trigger(Trigger::FollowUp);
            }
        });
    }

    async fn pass_body(
        self: &Arc<Self>,
        forced: bool,
        cancel: &CancellationToken,
        tally: &Mutex<Tally>,
    ) -> SyncResult<PassOutcome> {
        let pending = if forced {
            self.queue.list_pending()?
        } else {
            self.eligible_pending()?
        };
        if pending.is_empty() {
            return Ok(PassOutcome::NothingPending);
        }

        if !self.oracle.is_online().await {
            tracing::info!(pending = pending.len(), "offline; sync pass deferred");
            return Ok(PassOutcome::Offline);
        }

        match self.remote.check_session(cancel).await {
            Ok(()) => {}
            Err(SyncError::AuthRequired { status }) => {
                if !self.auth.has_cached_credential() {
                    let never_attempted = pending.iter().filter(|op| op.retry_count == 0).count();
                    tracing::warn!(status, never_attempted, "sign-in required to sync");
                    self.emit(SyncEvent::AuthRequired {
                        pending_count: never_attempted,
                    });
                } else {
                    tracing::warn!(status, "session rejected; sync pass deferred");
                }
                return Ok(PassOutcome::AuthRequired);
            }
            Err(SyncError::Cancelled) => return Ok(PassOutcome::Cancelled),
            Err(err) => {
                tracing::info!(error = %err, "session check failed; sync pass deferred");
                return Ok(PassOutcome::Offline);
            }
        }

        self.emit(SyncEvent::SyncStarted {
            pending_count: pending.len(),
        });

        // Claim the retry records of everything this pass attempts.
        for op in &pending {
            self.disarm(&op.id);
            self.ledger.remove_for_operation(&op.id)?;
        }

        let mut progress = Vec::new();
        let mut custom = Vec::new();
        let mut settings = Vec::new();
        for op in pending {
            match op.channel() {
                Channel::Progress => progress.push(op),
                Channel::Custom => custom.push(op),
                Channel::Settings => settings.push(op),
            }
        }

        let (progress, custom, settings) = tokio::join!(
            self.run_channel(Channel::Progress, progress, cancel, tally),
            self.run_channel(Channel::Custom, custom, cancel, tally),
            self.run_channel(Channel::Settings, settings, cancel, tally),
        );
        progress?;
        custom?;
        settings?;

        if cancel.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }
        Ok(PassOutcome::Completed)
    }

    async fn run_channel(
        self: &Arc<Self>,
        channel: Channel,
        ops: Vec<QueuedOperation>,
        cancel: &CancellationToken,
        tally: &Mutex<Tally>,
    ) -> SyncResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let tag = channel.tag();
        if self.breakers.is_open(tag) {
            tracing::debug!(channel = tag, skipped = ops.len(), "circuit open; channel skipped");
            return Ok(());
        }

        let transient = match channel {
            Channel::Progress => self.sync_progress(ops, cancel, tally).await?,
            Channel::Custom => self.sync_custom(ops, cancel, tally).await?,
            Channel::Settings => self.sync_settings(ops, cancel, tally).await?,
        };
        if transient {
            self.breakers.record_failure(tag);
        } else {
            self.breakers.record_success(tag);
        }
        Ok(())
    }

    async fn sync_progress(
        self: &Arc<Self>,
        ops: Vec<QueuedOperation>,
        cancel: &CancellationToken,
        tally: &Mutex<Tally>,
    ) -> SyncResult<bool> {
        let (latest, mut superseded) = collapse_progress(ops);
        let entries: Vec<ProgressEntry> = latest.iter().map(progress_entry).collect();
        tracing::debug!(operations = entries.len(), "sending progress batch");

        let mut transient = false;
        match self.remote.sync_progress_batch(entries, cancel).await {
            Ok(response) => {
                let conflicts: HashMap<String, ProgressRecord> = response
                    .conflicts
                    .into_iter()
                    .map(|conflict| (conflict.entity_id, conflict.server_data))
                    .collect();
                for op in &latest {
                    let result = match conflicts.get(op.entity_id()) {
                        Some(server) => self.resolve_progress(op, server.clone(), cancel).await,
                        None => Ok(()),
                    };
                    transient |= self.settle(op, result, tally)?;
                    self.settle_superseded(op, &mut superseded, tally)?;
                }
            }
            Err(SyncError::Conflict { body, .. }) if latest.len() == 1 => {
                let op = &latest[0];
                let result = self.resolve_progress_body(op, &body, cancel).await;
                transient |= self.settle(op, result, tally)?;
                self.settle_superseded(op, &mut superseded, tally)?;
            }
            Err(SyncError::Conflict { .. }) => {
                tracing::debug!("batch conflict; sending progress one at a time");
                for op in &latest {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let result = match self.remote.push_progress(&progress_entry(op), cancel).await {
                        Err(SyncError::Conflict { body, .. }) => {
                            self.resolve_progress_body(op, &body, cancel).await
                        }
                        other => other,
                    };
                    transient |= self.settle(op, result, tally)?;
                    self.settle_superseded(op, &mut superseded, tally)?;
                }
            }
            Err(err) => {
                let err = persistence_or(err)?;
                for op in &latest {
                    transient |= self.settle(op, Err(replicate(&err)), tally)?;
                }
            }
        }
        Ok(transient)
    }

    async fn resolve_progress_body(
        &self,
        op: &QueuedOperation,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let server: ProgressRecord = decode_json(body)?;
        self.resolve_progress(op, server, cancel).await
    }

    async fn resolve_progress(
        &self,
        op: &QueuedOperation,
        server: ProgressRecord,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let local = op
            .operation
            .progress_record(op.timestamp)
            .ok_or_else(|| SyncError::Validation(format!("{} carries no progress", op.id)))?;

        if requires_manual_resolution(&local, &server) {
            return Err(SyncError::ManualResolutionRequired(describe_conflict(
                &local, &server,
            )));
        }

        match resolve_progress_conflict(&local, &server, self.clock.now()) {
            Resolution::Resolved(merged) => {
                self.remote.put_progress(&merged, cancel).await?;
                self.applier.apply_progress(&merged)?;
                tracing::info!(
                    operation_id = %op.id,
                    problem_id = %merged.problem_id,
                    solve_count = merged.solve_count,
                    "merged progress conflict"
                );
                self.emit(SyncEvent::ConflictResolved {
                    operation_id: op.id.clone(),
                    entity_id: merged.problem_id.clone(),
                    channel: Channel::Progress,
                });
                Ok(())
            }
            Resolution::Manual(message) => Err(SyncError::ManualResolutionRequired(message)),
            Resolution::Error(message) => Err(SyncError::Validation(message)),
        }
    }

    /// Completes older edits folded into `newest` once it was delivered.
    /// Otherwise they stay Pending for the next pass.
    fn settle_superseded(
        &self,
        newest: &QueuedOperation,
        superseded: &mut HashMap<String, Vec<QueuedOperation>>,
        tally: &Mutex<Tally>,
    ) -> SyncResult<()> {
        let Some(older) = superseded.remove(&newest.id) else {
            return Ok(());
        };
        let delivered = tolerate_missing(self.queue.get(&newest.id))?
            .flatten()
            .is_some_and(|record| record.status == OperationStatus::Completed);
        if !delivered {
            tracing::debug!(
                operation_id = %newest.id,
                held = older.len(),
                "newest edit not delivered; older edits stay pending"
            );
            return Ok(());
        }
        for op in older {
            if tolerate_missing(self.queue.mark_completed(&op.id))?.unwrap_or(false) {
                tally.lock().synced += 1;
            }
        }
        Ok(())
    }

    async fn sync_custom(
        self: &Arc<Self>,
        ops: Vec<QueuedOperation>,
        cancel: &CancellationToken,
        tally: &Mutex<Tally>,
    ) -> SyncResult<bool> {
        let mut transient = false;
        for op in &ops {
            if cancel.is_cancelled() {
                break;
            }
            let result = match &op.operation {
                Operation::AddCustomProblem(_) => self.push_custom_problem(op, cancel).await,
                Operation::DeleteProblem(deletion) => {
                    self.remote
                        .delete_custom_problem(&deletion.problem_id, cancel)
                        .await
                }
                other => Err(SyncError::Validation(format!(
                    "{} does not belong to the custom channel",
                    other.kind()
                ))),
            };
            transient |= self.settle(op, result, tally)?;
        }
        Ok(transient)
    }

    async fn push_custom_problem(&self, op: &QueuedOperation, cancel: &CancellationToken) -> SyncResult<()> {
        let local = op
            .operation
            .custom_problem_record(op.timestamp)
            .ok_or_else(|| SyncError::Validation(format!("{} carries no custom problem", op.id)))?;

        let body = match self.remote.create_custom_problem(&local, cancel).await {
            Err(SyncError::Conflict { body, .. }) => body,
            other => return other,
        };
        let remote: CustomProblemRecord = decode_json(&body)?;
        match resolve_custom_conflict(&local, &remote) {
            Resolution::Resolved(winner) => {
                if winner == local {
                    self.remote.put_custom_problem(&local, cancel).await?;
                } else {
                    self.applier.apply_custom_problem(&winner)?;
                }
                tracing::info!(
                    operation_id = %op.id,
                    problem_id = %winner.id,
                    local_won = winner == local,
                    "resolved custom problem conflict"
                );
                self.emit(SyncEvent::ConflictResolved {
                    operation_id: op.id.clone(),
                    entity_id: winner.id,
                    channel: Channel::Custom,
                });
                Ok(())
            }
            Resolution::Manual(message) => Err(SyncError::ManualResolutionRequired(message)),
            Resolution::Error(message) => Err(SyncError::Validation(message)),
        }
    }

    async fn sync_settings(
        self: &Arc<Self>,
        ops: Vec<QueuedOperation>,
        cancel: &CancellationToken,
        tally: &Mutex<Tally>,
    ) -> SyncResult<bool> {
        let mut values = BTreeMap::new();
        let mut timestamp = Timestamp::EPOCH;
        for op in &ops {
            if let Operation::UpdateSettings(update) = &op.operation {
                values.extend(update.values.clone());
                timestamp = timestamp.max(op.timestamp);
            }
        }
        let local = SettingsRecord { values, timestamp };

        let result = match self.remote.put_settings(&local, cancel).await {
            Err(SyncError::Conflict { body, .. }) => {
                self.resolve_settings(&ops, &local, &body, cancel).await
            }
            other => other,
        };

        let result = match result {
            Ok(()) => Ok(()),
            Err(err) => Err(persistence_or(err)?),
        };
        let mut transient = false;
        for op in &ops {
            let outcome = match &result {
                Ok(()) => Ok(()),
                Err(err) => Err(replicate(err)),
            };
            transient |= self.settle(op, outcome, tally)?;
        }
        Ok(transient)
    }

    async fn resolve_settings(
        &self,
        ops: &[QueuedOperation],
        local: &SettingsRecord,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let remote: SettingsRecord = decode_json(body)?;
        let Resolution::Resolved(winner) = resolve_settings_conflict(local, &remote) else {
            return Err(SyncError::Validation("settings conflict could not be resolved".into()));
        };

        let local_won = winner == *local;
        if local_won {
            self.remote.put_settings(local, cancel).await?;
        } else {
            self.applier.apply_settings(&winner)?;
        }
        tracing::info!(local_won, "resolved settings conflict");
        if let Some(last) = ops.last() {
            self.emit(SyncEvent::ConflictResolved {
                operation_id: last.id.clone(),
                entity_id: "settings".into(),
                channel: Channel::Settings,
            });
        }
        Ok(())
    }

    /// Records the outcome of one operation. Returns true if it failed for
    /// a transient reason.
    fn settle(
        self: &Arc<Self>,
        op: &QueuedOperation,
        result: SyncResult<()>,
        tally: &Mutex<Tally>,
    ) -> SyncResult<bool> {
        let err = match result {
            Ok(()) => {
                if tolerate_missing(self.queue.mark_completed(&op.id))?.unwrap_or(false) {
                    tally.lock().synced += 1;
                }
                return Ok(false);
            }
            Err(err) => err,
        };
        let transient = matches!(err.kind(), ErrorKind::TransientNetwork | ErrorKind::Timeout);

        match err {
            SyncError::Persistence(err) => return Err(SyncError::Persistence(err)),
            SyncError::Cancelled => {}
            SyncError::ManualResolutionRequired(message) => {
                tracing::warn!(operation_id = %op.id, %message, "conflict needs manual resolution");
                if tolerate_missing(self.queue.mark_manual_resolution(&op.id, message.clone()))?
                    .unwrap_or(false)
                {
                    self.emit(SyncEvent::ManualResolutionRequired {
                        operation_id: op.id.clone(),
                        entity_id: op.entity_id().to_string(),
                        message,
                    });
                }
            }
            err if !err.is_retryable() => {
                tracing::warn!(operation_id = %op.id, kind = %op.kind(), error = %err, "operation rejected");
                self.fail(op, &err, op.retry_count, tally)?;
            }
            err if !err.counts_against_retry_budget() => {
                tracing::debug!(operation_id = %op.id, error = %err, "operation deferred");
            }
            err => self.schedule_retry(op, &err, tally)?,
        }
        Ok(transient)
    }

    fn fail(
        &self,
        op: &QueuedOperation,
        err: &SyncError,
        retry_count: u32,
        tally: &Mutex<Tally>,
    ) -> SyncResult<()> {
        if tolerate_missing(self.queue.mark_failed(&op.id, err.to_string()))?.unwrap_or(false) {
            tally.lock().failed += 1;
            self.emit(SyncEvent::OperationFailed {
                operation_id: op.id.clone(),
                kind: op.kind(),
                error: err.to_string(),
                retry_count,
            });
        }
        Ok(())
    }

    fn schedule_retry(
        self: &Arc<Self>,
        op: &QueuedOperation,
        err: &SyncError,
        tally: &Mutex<Tally>,
    ) -> SyncResult<()> {
        let Some(attempts) = tolerate_missing(self.queue.increment_retry(&op.id))? else {
            return Ok(());
        };
        let retry = &self.config.retry;
        if attempts >= retry.max_attempts {
            tracing::warn!(operation_id = %op.id, attempts, error = %err, "retries exhausted");
            return self.fail(op, err, attempts, tally);
        }

        let now = self.clock.now();
        let delay = retry.delay_for_attempt(attempts);
        let record = self
            .ledger
            .schedule(&op.id, now.saturating_add(delay), now)?;
        tracing::debug!(operation_id = %op.id, attempts, ?delay, error = %err, "retry scheduled");
        self.arm_timer(record);
        Ok(())
    }

    /// Arms an in-memory timer for a persisted retry. Does nothing outside a
    /// tokio runtime; the record is picked up on the next start instead.
    fn arm_timer(self: &Arc<Self>, record: PersistedRetry) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let delay = record.scheduled_for.duration_since(self.clock.now());
        let operation_id = record.operation_id.clone();
        let record_id = record.id.clone();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut timers = inner.timers.lock();
                if timers
                    .get(&record.operation_id)
                    .is_some_and(|(id, _)| *id == record.id)
                {
                    timers.remove(&record.operation_id);
                }
            }
            match inner.ledger.claim(&record) {
                Ok(true) => {
                    tracing::debug!(operation_id = %record.operation_id, "retry timer fired");
                    if !inner.trigger(Trigger::Retry) {
                        if let Err(err) = inner.run_pass(false).await {
                            tracing::warn!(error = %err, "retry pass failed");
                        }
                    }
                }
                Ok(false) => tracing::trace!("retry already claimed"),
                Err(err) => tracing::warn!(error = %err, "could not claim retry"),
            }
        });

        if let Some((_, previous)) = self.timers.lock().insert(operation_id, (record_id, handle)) {
            previous.abort();
        }
    }

    fn disarm(&self, operation_id: &str) {
        if let Some((_, handle)) = self.timers.lock().remove(operation_id) {
            handle.abort();
        }
    }

    fn disarm_all(&self) {
        for (_, (_, handle)) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

/// Keeps the newest progress operation per (kind, problem). Returns them in
/// queue order with the older ones keyed by the id that replaced them.
fn collapse_progress(
    ops: Vec<QueuedOperation>,
) -> (Vec<QueuedOperation>, HashMap<String, Vec<QueuedOperation>>) {
    let mut newest: HashMap<(OperationKind, String), QueuedOperation> = HashMap::new();
    let mut older: Vec<(OperationKind, String, QueuedOperation)> = Vec::new();

    for op in ops {
        let key = (op.kind(), op.entity_id().to_string());
        match newest.get(&key) {
            Some(current) if current.timestamp > op.timestamp => {
                older.push((key.0, key.1, op));
            }
            _ => {
                if let Some(replaced) = newest.insert(key.clone(), op) {
                    older.push((key.0, key.1, replaced));
                }
            }
        }
    }

    let mut superseded: HashMap<String, Vec<QueuedOperation>> = HashMap::new();
    for (kind, entity, op) in older {
        if let Some(winner) = newest.get(&(kind, entity)) {
            superseded.entry(winner.id.clone()).or_default().push(op);
        }
    }

    let mut latest: Vec<QueuedOperation> = newest.into_values().collect();
    latest.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    (latest, superseded)
}

fn progress_entry(op: &QueuedOperation) -> ProgressEntry {
    ProgressEntry {
        entity_id: op.entity_id().to_string(),
        operation: op.operation.clone(),
        timestamp: op.timestamp,
        device_id: op.device_id.clone(),
    }
}

/// Passes persistence failures up; returns every other error.
fn persistence_or(err: SyncError) -> SyncResult<SyncError> {
    match err {
        SyncError::Persistence(err) => Err(SyncError::Persistence(err)),
        other => Ok(other),
    }
}

/// Copies a request failure so it can be settled against several
/// operations.
fn replicate(err: &SyncError) -> SyncError {
    match err {
        SyncError::TransientNetwork(message) => SyncError::TransientNetwork(message.clone()),
        SyncError::AuthRequired { status } => SyncError::AuthRequired { status: *status },
        SyncError::Conflict { entity_id, body } => SyncError::Conflict {
            entity_id: entity_id.clone(),
            body: body.clone(),
        },
        SyncError::Validation(message) => SyncError::Validation(message.clone()),
        SyncError::ManualResolutionRequired(message) => {
            SyncError::ManualResolutionRequired(message.clone())
        }
        SyncError::Codec(message) => SyncError::Codec(message.clone()),
        SyncError::Timeout => SyncError::Timeout,
        SyncError::Cancelled => SyncError::Cancelled,
        SyncError::Offline => SyncError::Offline,
        other => SyncError::TransientNetwork(other.to_string()),
    }
}

/// Treats a record deleted mid-pass (by `clear_all`) as nothing to do.
fn tolerate_missing<T>(result: SyncResult<T>) -> SyncResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SyncError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
