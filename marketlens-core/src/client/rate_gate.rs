//! Token-bucket rate gate shared by every upstream request.
//!
//! Callers over the rate block until a token frees up; they never get an
//! error for local rate reasons. The lock is released while sleeping so
//! waiters don't serialize on the mutex.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Waits longer than this get a debug event.
const SLOW_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateGate {
    bucket: Mutex<Bucket>,
    /// Tokens per second. Non-positive means unlimited.
    rate: f64,
    capacity: f64,
}

impl RateGate {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate: requests_per_second,
            capacity,
        }
    }

    /// A gate that never blocks.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if self.rate <= 0.0 {
            return Ok(());
        }
        let mut b = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.capacity);
        b.last_refill = now;
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - b.tokens) / self.rate))
        }
    }

    /// Block until a token is available. Returns the time spent waiting.
    pub fn acquire(&self) -> Duration {
        let started = Instant::now();
        while let Err(wait) = self.try_acquire() {
            std::thread::sleep(wait);
        }
        let waited = started.elapsed();
        if waited >= SLOW_WAIT {
            debug!(wait_ms = waited.as_millis() as u64, "rate gate wait");
        }
        waited
    }

    /// Like [`acquire`](Self::acquire) but gives up instead of waiting past
    /// `deadline`. Returns `false` when the deadline would be missed.
    pub fn acquire_before(&self, deadline: Instant) -> bool {
        loop {
            match self.try_acquire() {
                Ok(()) => return true,
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return false;
                    }
                    std::thread::sleep(wait);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn burst_is_free() {
        let gate = RateGate::new(1.0, 5);
        for _ in 0..5 {
            assert!(gate.try_acquire().is_ok());
        }
        assert!(gate.try_acquire().is_err());
    }

    #[test]
    fn waits_roughly_one_interval_after_burst() {
        let gate = RateGate::new(20.0, 1);
        gate.acquire();
        let waited = gate.acquire();
        assert!(waited >= Duration::from_millis(30), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[test]
    fn unlimited_never_blocks() {
        let gate = RateGate::unlimited();
        for _ in 0..1000 {
            assert!(gate.try_acquire().is_ok());
        }
    }

    #[test]
    fn deadline_is_respected() {
        let gate = RateGate::new(0.5, 1);
        gate.acquire();
        assert!(!gate.acquire_before(Instant::now() + Duration::from_millis(50)));
    }

    #[test]
    fn concurrent_callers_share_the_rate() {
        let gate = Arc::new(RateGate::new(50.0, 1));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = Arc::clone(&gate);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        g.acquire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 12 tokens at 50/s with a burst of 1: at least 11 refills.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
