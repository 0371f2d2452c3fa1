//! Circuit breaker for the upstream API.
//!
//! After `threshold` consecutive fetches exhaust their retries, the breaker
//! opens and every call short-circuits until the cooldown expires. An auth
//! rejection (401/403) does not count: it cannot be waited out.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls go through; failures are being counted.
    Closed,
    /// Calls fail fast with `CircuitOpen` until the cooldown has passed.
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

/// Consecutive-failure breaker shared by every request of one client.
///
/// There is no half-open state: once the cooldown has passed the
/// breaker closes with a clean count, and the next exhausted fetch starts
/// counting again.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cooldown: Duration,
    threshold: u32,
}

impl CircuitBreaker {
    /// A closed breaker that opens after `threshold` consecutive failures
    /// (at least one) and stays open for `cooldown`.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            threshold: threshold.max(1),
        }
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self::new(u32::MAX, Duration::ZERO)
    }

    /// `Ok` if calls may proceed, otherwise the remaining cooldown.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { tripped_at } => {
                let elapsed = tripped_at.elapsed();
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    info!("circuit breaker closed after cooldown");
                    Ok(())
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
        }
    }

    /// Like [`check`](Self::check), without the cooldown. Closes an
    /// expired breaker as a side effect.
    pub fn is_allowed(&self) -> bool {
        self.check().is_ok()
    }

    /// Reset the failure count.
    pub fn record_success(&self) {
        self.inner.lock().consecutive_failures = 0;
    }

    /// Count one exhausted fetch; trips at the threshold.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.threshold
            && matches!(inner.state, BreakerState::Closed)
        {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker tripped"
            );
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// State as last recorded. An expired `Open` stays `Open` here
    /// until the next [`check`](Self::check).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Time until an open breaker lets calls through; zero when closed.
    pub fn remaining_cooldown(&self) -> Duration {
        match self.inner.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => self.cooldown.saturating_sub(tripped_at.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn trips_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_allowed());
        cb.record_failure();
        assert!(cb.check().is_err());
    }

    #[test]
    fn success_resets_counter() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.is_allowed());
    }

    #[test]
    fn closes_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn disabled_never_opens() {
        let cb = CircuitBreaker::disabled();
        for _ in 0..100 {
            cb.record_failure();
        }
        assert!(cb.is_allowed());
    }
}
