//! Connectivity oracle.
//!
//! Answers "is the remote reachable right now?" from a cached verdict while
//! it is fresh and from a lightweight `HEAD` probe once it is stale. An
//! external signal (the OS reporting a network change) overrides the cache
//! immediately.

use crate::config::ConnectivityConfig;
use crate::notify::{Subscribers, Subscription};
use crate::transport::{HttpMethod, HttpRequest, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Snapshot of the oracle's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    /// Last verdict; `None` until the first probe or signal.
    pub is_online: Option<bool>,
    /// When the verdict was reached.
    pub last_checked_at: Option<Instant>,
    /// Whether a probe is running.
    pub check_in_progress: bool,
    /// Offline verdicts since the last online one.
    pub consecutive_failures: u32,
}

struct Verdict {
    is_online: Option<bool>,
    last_checked_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Tracks whether the remote is reachable.
pub struct ConnectivityOracle {
    transport: Arc<dyn Transport>,
    config: ConnectivityConfig,
    verdict: Mutex<Verdict>,
    check_in_progress: AtomicBool,
    subscribers: Subscribers<bool>,
    cancel: Mutex<CancellationToken>,
}

/// Clears the in-progress flag even if the probe future is dropped.
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ConnectivityOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityOracle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectivityOracle {
    /// Creates an oracle in the unknown state.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectivityConfig) -> Self {
        Self {
            transport,
            config,
            verdict: Mutex::new(Verdict {
                is_online: None,
                last_checked_at: None,
                consecutive_failures: 0,
            }),
            check_in_progress: AtomicBool::new(false),
            subscribers: Subscribers::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> ConnectivityState {
        let verdict = self.verdict.lock();
        ConnectivityState {
            is_online: verdict.is_online,
            last_checked_at: verdict.last_checked_at,
            check_in_progress: self.check_in_progress.load(Ordering::SeqCst),
            consecutive_failures: verdict.consecutive_failures,
        }
    }

    /// Returns the cached verdict without probing. Unknown counts as
    /// offline.
    pub fn cached(&self) -> bool {
        self.verdict.lock().is_online.unwrap_or(false)
    }

    /// Returns whether the remote is reachable, probing if the cached
    /// verdict is stale.
    pub async fn is_online(&self) -> bool {
        if let Some(online) = self.fresh_verdict() {
            return online;
        }
        self.probe().await
    }

    /// Probes regardless of freshness.
    pub async fn force_check(&self) -> bool {
        self.probe().await
    }

    /// Records an externally observed network state.
    pub fn set_external_signal(&self, online: bool) {
        tracing::debug!(online, "external connectivity signal");
        self.record(online);
    }

    /// Calls `callback` once per online/offline transition.
    pub fn on_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(move |online: &bool| callback(*online))
    }

    /// Returns how long to wait before the next reconnect attempt:
    /// `base * multiplier^consecutive_failures`, capped.
    pub fn retry_delay(&self) -> Duration {
        let failures = self.verdict.lock().consecutive_failures;
        self.config.retry.delay_for_attempt(failures.saturating_add(1))
    }

    /// Aborts any running probe. Later probes get a fresh token, so the
    /// oracle keeps working after a restart.
    pub fn shutdown(&self) {
        let running = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        running.cancel();
    }

    fn fresh_verdict(&self) -> Option<bool> {
        let verdict = self.verdict.lock();
        let online = verdict.is_online?;
        let checked = verdict.last_checked_at?;
        let window = if online {
            self.config.online_freshness
        } else {
            self.config.offline_freshness
        };
        (checked.elapsed() < window).then_some(online)
    }

    async fn probe(&self) -> bool {
        if self
            .check_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.cached();
        }
        let _guard = ProbeGuard(&self.check_in_progress);
        let cancel = self.cancel.lock().clone();

        let request = HttpRequest::new(HttpMethod::Head, self.config.probe_path.clone())
            .with_timeout(self.config.probe_timeout);
        let online = match tokio::time::timeout(
            self.config.probe_timeout,
            self.transport.send(request, &cancel),
        )
        .await
        {
            Ok(Ok(response)) => !response.is_server_error(),
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "connectivity probe failed");
                false
            }
            Err(_) => {
                tracing::debug!("connectivity probe timed out");
                false
            }
        };

        self.record(online);
        online
    }

    fn record(&self, online: bool) {
        let changed = {
            let mut verdict = self.verdict.lock();
            let was_online = verdict.is_online.unwrap_or(false);
            verdict.is_online = Some(online);
            verdict.last_checked_at = Some(Instant::now());
            verdict.consecutive_failures = if online {
                0
            } else {
                verdict.consecutive_failures.saturating_add(1)
            };
            was_online != online
        };

        if changed {
            tracing::info!(online, "connectivity changed");
            self.subscribers.emit(&online);
        }
    }
}
