//! A small rate limiter for the accept-layer logging described in the error handling design:
//! one log line per second per error class, regardless of how many offending sockets arrive in
//! that window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Gates repeated log lines for a single error class to at most once per `period`.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    last_logged: AtomicU64,
    epoch: Instant,
}

impl RateLimiter {
    /// Creates a limiter allowing one event through per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_logged: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Returns `true` if an event should be logged now, and records that it was.
    pub fn allow(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_logged.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.period.as_millis() as u64 {
            return false;
        }
        // Racing callers may both pass the check above; only one should win the log line. This
        // doesn't need to be perfectly exact, just bounded.
        self.last_logged
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_allowed() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.allow());
    }

    #[test]
    fn immediate_repeat_is_suppressed() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn allowed_again_after_period_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        assert!(limiter.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow());
    }
}
