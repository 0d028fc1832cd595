//! Priority retry scheduler.
//!
//! Tasks wait in a queue ordered by priority, then creation. A task is
//! eligible once the larger of its priority's minimum interval and its
//! backoff has passed since its last attempt. Failed tasks go back into the
//! queue until they run out of retries. Each tag has its own circuit
//! breaker.

use crate::breaker::{CircuitBreakerState, CircuitBreakers};
use crate::config::SchedulerConfig;
use crate::connectivity::ConnectivityOracle;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Scheduling priority. Higher priorities sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    /// User-initiated or connectivity-triggered work.
    High,
    /// Routine work.
    Normal,
    /// Background housekeeping.
    Low,
}

/// A boxed task future.
pub type TaskFuture = Pin<Box<dyn Future<Output = SyncResult<()>> + Send>>;

type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Bookkeeping for a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    /// Task id.
    pub id: String,
    /// Tag shared by related tasks; also the circuit breaker key.
    pub tag: String,
    /// Priority.
    pub priority: Priority,
    /// Failed runs so far.
    pub retry_count: u32,
    /// Failed runs allowed before the task is abandoned.
    pub max_retries: u32,
    /// When the task was scheduled.
    pub created_at: Instant,
    /// When the task last ran.
    pub last_attempt: Option<Instant>,
}

/// Options for [`RetryScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Priority.
    pub priority: Priority,
    /// Failed runs allowed before the task is abandoned.
    pub max_retries: u32,
}

impl ScheduleOptions {
    /// Creates options with a priority and the default retry allowance.
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Sets the retry allowance.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_retries: 3,
        }
    }
}

/// Outcome of [`RetryScheduler::force_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForceSyncReport {
    /// Tasks that succeeded.
    pub completed: usize,
    /// Tasks that failed.
    pub failed: usize,
}

struct QueuedTask {
    task: SyncTask,
    execute: TaskFn,
}

type QueueKey = (Priority, u64);

struct Shared {
    config: SchedulerConfig,
    queue: Mutex<BTreeMap<QueueKey, QueuedTask>>,
    next_seq: AtomicU64,
    running: AtomicUsize,
    breakers: CircuitBreakers,
    wake: Notify,
    oracle: Option<Arc<ConnectivityOracle>>,
    driver: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Runs tasks with priorities, backoff, and circuit breaking.
#[derive(Clone)]
pub struct RetryScheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("queued", &self.len())
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    /// Creates a scheduler that runs regardless of connectivity.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a scheduler that only runs tasks while `oracle` reports the
    /// remote reachable. [`RetryScheduler::force_sync`] ignores the oracle.
    pub fn with_connectivity(config: SchedulerConfig, oracle: Arc<ConnectivityOracle>) -> Self {
        Self::build(config, Some(oracle))
    }

    fn build(config: SchedulerConfig, oracle: Option<Arc<ConnectivityOracle>>) -> Self {
        let breakers = CircuitBreakers::new(config.breaker.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(BTreeMap::new()),
                next_seq: AtomicU64::new(0),
                running: AtomicUsize::new(0),
                breakers,
                wake: Notify::new(),
                oracle,
                driver: Mutex::new(None),
            }),
        }
    }

    /// Queues a task and returns its id. High priority tasks wake the
    /// driver immediately.
    pub fn schedule<F, Fut>(&self, tag: impl Into<String>, execute: F, options: ScheduleOptions) -> String
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let task = SyncTask {
            id: uuid::Uuid::new_v4().to_string(),
            tag: tag.into(),
            priority: options.priority,
            retry_count: 0,
            max_retries: options.max_retries,
            created_at: Instant::now(),
            last_attempt: None,
        };
        let id = task.id.clone();
        tracing::debug!(task_id = %id, tag = %task.tag, priority = ?task.priority, "scheduled task");

        let execute: TaskFn = Arc::new(move || Box::pin(execute()) as TaskFuture);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared
            .queue
            .lock()
            .insert((options.priority, seq), QueuedTask { task, execute });

        if options.priority == Priority::High {
            self.shared.wake.notify_one();
        }
        id
    }

    /// Removes a queued task. Running tasks are not affected.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut queue = self.shared.queue.lock();
        let key = queue
            .iter()
            .find(|(_, queued)| queued.task.id == task_id)
            .map(|(key, _)| *key);
        key.and_then(|key| queue.remove(&key)).is_some()
    }

    /// Removes every queued task with `tag`. Returns how many were removed.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|_, queued| queued.task.tag != tag);
        before - queue.len()
    }

    /// Returns queued tasks in run order.
    pub fn queued(&self) -> Vec<SyncTask> {
        self.shared
            .queue
            .lock()
            .values()
            .map(|queued| queued.task.clone())
            .collect()
    }

    /// Returns true if a task with `tag` is queued.
    pub fn has_queued(&self, tag: &str) -> bool {
        self.shared
            .queue
            .lock()
            .values()
            .any(|queued| queued.task.tag == tag)
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of running tasks.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of a tag's circuit breaker.
    pub fn breaker_state(&self, tag: &str) -> CircuitBreakerState {
        self.shared.breakers.state(tag)
    }

    /// Runs the eligible tasks that fit in the free concurrency slots and
    /// waits for them. Returns how many ran.
    pub async fn run_due(&self) -> usize {
        let shared = &self.shared;
        let slots = shared
            .config
            .max_concurrent
            .saturating_sub(shared.running.load(Ordering::SeqCst));
        if slots == 0 || !self.any_eligible() {
            return 0;
        }

        if let Some(oracle) = &shared.oracle {
            if !oracle.is_online().await {
                tracing::debug!("offline; deferring scheduled tasks");
                return 0;
            }
        }

        let batch = self.take_eligible(slots);
        if batch.is_empty() {
            return 0;
        }
        shared.running.fetch_add(batch.len(), Ordering::SeqCst);

        let mut set = JoinSet::new();
        for (key, queued) in batch {
            let run = (queued.execute)();
            let timeout = shared.config.task_timeout;
            set.spawn(async move {
                let result = match tokio::time::timeout(timeout, run).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout),
                };
                (key, queued, result)
            });
        }

        let mut ran = 0;
        while let Some(joined) = set.join_next().await {
            shared.running.fetch_sub(1, Ordering::SeqCst);
            ran += 1;
            match joined {
                Ok((key, queued, result)) => self.settle(key, queued, result),
                Err(err) => tracing::warn!(error = %err, "scheduled task aborted"),
            }
        }
        ran
    }

    /// Runs every queued task now, one at a time, ignoring eligibility,
    /// backoff, breakers, and connectivity. The task timeout still applies.
    /// Failed tasks are not queued again.
    pub async fn force_sync(&self) -> ForceSyncReport {
        let drained: Vec<QueuedTask> = std::mem::take(&mut *self.shared.queue.lock())
            .into_values()
            .collect();

        let mut report = ForceSyncReport::default();
        for queued in drained {
            let result = match tokio::time::timeout(self.shared.config.task_timeout, (queued.execute)()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout),
            };
            match result {
                Ok(()) => {
                    self.shared.breakers.record_success(&queued.task.tag);
                    report.completed += 1;
                }
                Err(err) => {
                    tracing::debug!(task_id = %queued.task.id, error = %err, "forced task failed");
                    self.shared.breakers.record_failure(&queued.task.tag);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Starts the background driver. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut driver = self.shared.driver.lock();
        if driver.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let scheduler = self.clone();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = scheduler.shared.wake.notified() => {}
                    _ = tokio::time::sleep(scheduler.shared.config.idle_tick) => {}
                }
                scheduler.run_due().await;
            }
            tracing::debug!("scheduler driver stopped");
        });
        *driver = Some((token, handle));
    }

    /// Stops the background driver. Queued tasks stay queued.
    pub fn shutdown(&self) {
        if let Some((token, handle)) = self.shared.driver.lock().take() {
            token.cancel();
            handle.abort();
            self.shared.running.store(0, Ordering::SeqCst);
        }
    }

    fn is_eligible(&self, task: &SyncTask, now: Instant) -> bool {
        let Some(last) = task.last_attempt else {
            return true;
        };
        let config = &self.shared.config;
        let wait = config
            .min_interval(task.priority)
            .max(config.retry.delay_for_attempt(task.retry_count));
        now >= last + wait
    }

    fn any_eligible(&self) -> bool {
        let now = Instant::now();
        self.shared
            .queue
            .lock()
            .values()
            .any(|queued| self.is_eligible(&queued.task, now))
    }

    fn take_eligible(&self, slots: usize) -> Vec<(QueueKey, QueuedTask)> {
        let now = Instant::now();
        let mut queue = self.shared.queue.lock();
        let keys: Vec<QueueKey> = queue
            .iter()
            .filter(|(_, queued)| self.is_eligible(&queued.task, now))
            .filter(|(_, queued)| !self.shared.breakers.is_open(&queued.task.tag))
            .take(slots)
            .map(|(key, _)| *key)
            .collect();

        keys.into_iter()
            .filter_map(|key| queue.remove(&key).map(|queued| (key, queued)))
            .collect()
    }

    fn settle(&self, key: QueueKey, mut queued: QueuedTask, result: SyncResult<()>) {
        let task = &mut queued.task;
        match result {
            Ok(()) => {
                self.shared.breakers.record_success(&task.tag);
                tracing::debug!(task_id = %task.id, tag = %task.tag, "task completed");
            }
            Err(err) => {
                self.shared.breakers.record_failure(&task.tag);
                task.retry_count = task.retry_count.saturating_add(1);
                task.last_attempt = Some(Instant::now());

                if task.retry_count > task.max_retries {
                    tracing::warn!(
                        task_id = %task.id,
                        tag = %task.tag,
                        retry_count = task.retry_count,
                        error = %err,
                        "abandoning task after exhausting retries"
                    );
                    return;
                }
                tracing::debug!(
                    task_id = %task.id,
                    tag = %task.tag,
                    retry_count = task.retry_count,
                    error = %err,
                    "task failed; will retry"
                );
                self.shared.queue.lock().insert(key, queued);
            }
        }
    }
}
