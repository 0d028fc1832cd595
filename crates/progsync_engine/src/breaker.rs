//! Per-tag circuit breakers.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// State of one tag's breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Failures since the last success or reset.
    pub failures: u32,
    /// When the latest failure happened.
    pub last_failure_at: Option<Instant>,
    /// Whether calls on the tag are currently refused.
    pub is_open: bool,
}

/// A set of circuit breakers keyed by tag.
///
/// A breaker opens once its failures reach the threshold. It closes again
/// after the cooldown or on any success on the same tag.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakers {
    /// Creates breakers sharing one policy.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if calls on `tag` should be refused.
    ///
    /// An open breaker whose cooldown has passed is reset here.
    pub fn is_open(&self, tag: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get(tag) else {
            return false;
        };
        if !state.is_open {
            return false;
        }

        let cooled = state
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown);
        if cooled {
            tracing::info!(tag, "circuit breaker cooled down");
            states.remove(tag);
            return false;
        }
        true
    }

    /// Records a success, closing the breaker.
    pub fn record_success(&self, tag: &str) {
        if let Some(state) = self.states.lock().remove(tag) {
            if state.is_open {
                tracing::info!(tag, "circuit breaker closed after success");
            }
        }
    }

    /// Records a failure. Returns true if the breaker is now open.
    pub fn record_failure(&self, tag: &str) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(tag.to_string()).or_default();
        state.failures = state.failures.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        if !state.is_open && state.failures >= self.config.failure_threshold {
            state.is_open = true;
            tracing::warn!(tag, failures = state.failures, "circuit breaker opened");
        }
        state.is_open
    }

    /// Returns a snapshot of a tag's breaker.
    pub fn state(&self, tag: &str) -> CircuitBreakerState {
        self.states.lock().get(tag).copied().unwrap_or_default()
    }

    /// Closes every breaker.
    pub fn reset_all(&self) {
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn trips_at_threshold_and_cools_down() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        for _ in 0..4 {
            assert!(!breakers.record_failure("progress"));
        }
        assert!(!breakers.is_open("progress"));

        assert!(breakers.record_failure("progress"));
        assert!(breakers.is_open("progress"));
        assert!(!breakers.is_open("settings"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breakers.is_open("progress"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breakers.is_open("progress"));
        assert_eq!(breakers.state("progress"), CircuitBreakerState::default());
    }

    #[test]
    fn success_resets() {
        let breakers = CircuitBreakers::new(BreakerConfig::default().with_failure_threshold(2));
        breakers.record_failure("custom");
        breakers.record_failure("custom");
        assert!(breakers.is_open("custom"));

        breakers.record_success("custom");
        assert!(!breakers.is_open("custom"));
        assert_eq!(breakers.state("custom").failures, 0);
    }
}
