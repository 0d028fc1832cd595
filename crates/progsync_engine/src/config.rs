//! Configuration for the sync engine.

use crate::scheduler::Priority;
use progsync_protocol::CLIENT_VERSION;
use std::time::Duration;

/// REST paths of the remote authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Reachability probe (`HEAD`).
    pub health: String,
    /// Session check (`GET`).
    pub session: String,
    /// Batch progress sync (`POST`).
    pub progress_batch: String,
    /// Per-problem progress base path.
    pub progress: String,
    /// Custom problems collection.
    pub custom_problems: String,
    /// Settings resource (`PUT`).
    pub settings: String,
}

impl Endpoints {
    /// Path of a single problem's progress.
    pub fn progress_item(&self, problem_id: &str) -> String {
        format!("{}/{}", self.progress, problem_id)
    }

    /// Path of a single custom problem.
    pub fn custom_problem(&self, id: &str) -> String {
        format!("{}/{}", self.custom_problems, id)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            health: "/api/health".into(),
            session: "/api/auth/session".into(),
            progress_batch: "/api/progress/batch".into(),
            progress: "/api/progress".into(),
            custom_problems: "/api/custom-problems".into(),
            settings: "/api/settings".into(),
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device id override. When unset the queue's persisted id is used.
    pub device_id: Option<String>,
    /// Version string reported to the remote.
    pub client_version: String,
    /// REST paths.
    pub endpoints: Endpoints,
    /// Timeout for a single remote request.
    pub request_timeout: Duration,
    /// Timeout for a whole sync pass.
    pub pass_timeout: Duration,
    /// Delay before the follow-up pass when work remains.
    pub follow_up_delay: Duration,
    /// Interval for periodic background passes.
    pub periodic_interval: Option<Duration>,
    /// Per-operation retry policy.
    pub retry: RetryConfig,
    /// Per-channel circuit breaker policy.
    pub breaker: BreakerConfig,
}

impl SyncConfig {
    /// Creates a configuration with default timings.
    pub fn new() -> Self {
        Self {
            device_id: None,
            client_version: CLIENT_VERSION.to_string(),
            endpoints: Endpoints::default(),
            request_timeout: Duration::from_secs(15),
            pass_timeout: Duration::from_secs(60),
            follow_up_delay: Duration::from_secs(5),
            periodic_interval: Some(Duration::from_secs(300)),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Sets the device id.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Sets the REST paths.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pass timeout.
    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Sets the follow-up delay.
    pub fn with_follow_up_delay(mut self, delay: Duration) -> Self {
        self.follow_up_delay = delay;
        self
    }

    /// Sets the periodic interval.
    pub fn with_periodic_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker policy.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the default curve.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay after the `attempt`-th failure.
    ///
    /// Attempt 0 has no delay; attempt `n` waits
    /// `min(initial * multiplier^(n-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker stays open.
    pub cooldown: Duration,
}

impl BreakerConfig {
    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Configuration for the retry scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tasks allowed to run at once.
    pub max_concurrent: usize,
    /// Deadline for a single task run.
    pub task_timeout: Duration,
    /// Minimum gap between attempts of a High priority task.
    pub high_interval: Duration,
    /// Minimum gap between attempts of a Normal priority task.
    pub normal_interval: Duration,
    /// Minimum gap between attempts of a Low priority task.
    pub low_interval: Duration,
    /// Backoff after failed runs.
    pub retry: RetryConfig,
    /// Per-tag circuit breaker policy.
    pub breaker: BreakerConfig,
    /// How often the driver rescans when nothing wakes it.
    pub idle_tick: Duration,
}

impl SchedulerConfig {
    /// Returns the minimum interval between attempts at a priority.
    pub fn min_interval(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high_interval,
            Priority::Normal => self.normal_interval,
            Priority::Low => self.low_interval,
        }
    }

    /// Sets the concurrency limit.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Sets the task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker policy.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            task_timeout: Duration::from_secs(30),
            high_interval: Duration::from_secs(5),
            normal_interval: Duration::from_secs(30),
            low_interval: Duration::from_secs(300),
            retry: RetryConfig::new(3),
            breaker: BreakerConfig::default(),
            idle_tick: Duration::from_secs(1),
        }
    }
}

/// Configuration for the connectivity oracle.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Path probed with `HEAD`.
    pub probe_path: String,
    /// Deadline for a probe.
    pub probe_timeout: Duration,
    /// How long an online verdict stays fresh.
    pub online_freshness: Duration,
    /// How long an offline verdict stays fresh.
    pub offline_freshness: Duration,
    /// Pacing for reconnect attempts.
    pub retry: RetryConfig,
}

impl ConnectivityConfig {
    /// Sets the probe path.
    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    /// Sets the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_path: Endpoints::default().health,
            probe_timeout: Duration::from_secs(3),
            online_freshness: Duration::from_secs(10),
            offline_freshness: Duration::from_secs(5),
            retry: RetryConfig::new(u32::MAX).with_max_delay(Duration::from_secs(30)),
        }
    }
}
