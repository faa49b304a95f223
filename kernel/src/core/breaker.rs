//! Consecutive-failure circuit breaker for unreliable decision backends.
//!
//! No half-open state: the first success after any number of failures closes
//! the breaker and resets the counter.

use serde::{Deserialize, Serialize};

/// Persistable breaker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub open_until_ms: Option<u64>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown_ms: u64,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self::with_state(threshold, cooldown_ms, BreakerState::default())
    }

    pub fn with_state(threshold: u32, cooldown_ms: u64, state: BreakerState) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown_ms,
            state,
        }
    }

    pub fn state(&self) -> &BreakerState {
        &self.state
    }

    pub fn is_open(&self, now_ms: u64) -> bool {
        self.state.open_until_ms.is_some_and(|until| now_ms < until)
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self, reason: &str, now_ms: u64) -> bool {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_failure = Some(reason.to_string());
        if self.state.consecutive_failures >= self.threshold {
            self.state.open_until_ms = Some(now_ms.saturating_add(self.cooldown_ms));
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.state.consecutive_failures = 0;
        self.state.open_until_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold_for_cooldown_window() {
        let mut breaker = CircuitBreaker::new(3, 1_000);
        assert!(!breaker.record_failure("timeout", 10));
        assert!(!breaker.record_failure("timeout", 20));
        assert!(!breaker.is_open(20));
        assert!(breaker.record_failure("exit:1", 30));
        assert!(breaker.is_open(30));
        assert!(breaker.is_open(1_029));
        assert!(!breaker.is_open(1_030));
        assert_eq!(breaker.state().last_failure.as_deref(), Some("exit:1"));
    }

    #[test]
    fn success_resets_counter_and_closes() {
        let mut breaker = CircuitBreaker::new(2, 1_000);
        breaker.record_failure("empty", 0);
        breaker.record_failure("empty", 0);
        assert!(breaker.is_open(1));
        breaker.record_success();
        assert!(!breaker.is_open(1));
        assert_eq!(breaker.state().consecutive_failures, 0);
        assert!(!breaker.record_failure("empty", 2));
    }

    #[test]
    fn failure_after_cooldown_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(2, 100);
        breaker.record_failure("parse", 0);
        breaker.record_failure("parse", 0);
        assert!(!breaker.is_open(100));
        assert!(breaker.record_failure("parse", 100));
        assert!(breaker.is_open(150));
    }
}
