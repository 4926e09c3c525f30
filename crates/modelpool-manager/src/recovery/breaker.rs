//! Circuit breaker for the worker-pool boundary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Breaker states: `Closed` passes calls through, `Open` rejects them,
/// `HalfOpen` admits a limited probe after the cool-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const HALF_OPEN_PROBES: u64 = 3;

#[derive(Debug)]
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    opened_at: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU64,
    half_open_successes: AtomicU64,
    failure_threshold: u64,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u64, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(BreakerState::Closed),
            opened_at: RwLock::new(None),
            consecutive_failures: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed right now. An open breaker flips to
    /// half-open once the cool-down has elapsed.
    pub async fn can_execute(&self) -> bool {
        let state = *self.state.read().await;
        match state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                self.half_open_successes.load(Ordering::Relaxed) < HALF_OPEN_PROBES
            }
            BreakerState::Open => {
                let elapsed = {
                    let opened = self.opened_at.read().await;
                    opened.map(|t| t.elapsed())
                };
                if elapsed.is_some_and(|e| e >= self.cooldown) {
                    let mut state = self.state.write().await;
                    if *state == BreakerState::Open {
                        *state = BreakerState::HalfOpen;
                        self.half_open_successes.store(0, Ordering::Relaxed);
                        info!("worker circuit breaker half-open, probing recovery");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let state = *self.state.read().await;
        if state == BreakerState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= HALF_OPEN_PROBES {
                let mut state = self.state.write().await;
                *state = BreakerState::Closed;
                *self.opened_at.write().await = None;
                info!("worker circuit breaker closed, fleet recovered");
            }
        }
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        let state = *self.state.read().await;
        let should_open = match state {
            // A half-open probe failure reopens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => failures >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            let mut state = self.state.write().await;
            if *state != BreakerState::Open {
                *state = BreakerState::Open;
                *self.opened_at.write().await = Some(Instant::now());
                warn!(failures, "worker circuit breaker opened");
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure().await;
            assert_eq!(breaker.state().await, BreakerState::Closed);
        }
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_cooldown_then_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        for _ in 0..HALF_OPEN_PROBES {
            breaker.record_success().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }
}
