//! Per-session token bucket.
//!
//! Sessions get a bucket of 10 with a 2/s refill; over-limit client
//! messages are answered with a `rate_limited` error and never reach the
//! room actor. (REST traffic is governed separately at the HTTP layer.)

use std::time::Instant;

pub const DEFAULT_CAPACITY: f64 = 10.0;
pub const DEFAULT_REFILL_PER_SEC: f64 = 2.0;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn session_default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_capacity_then_limited() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(bucket.try_acquire_at(now));
        }
        assert!(!bucket.try_acquire_at(now));
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(bucket.try_acquire_at(start));
        }
        assert!(!bucket.try_acquire_at(start));

        // One second refills two tokens.
        let later = start + Duration::from_secs(1);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        let start = Instant::now();
        assert!(bucket.try_acquire_at(start));

        let much_later = start + Duration::from_secs(3600);
        let mut granted = 0;
        while bucket.try_acquire_at(much_later) {
            granted += 1;
        }
        assert_eq!(granted, 10);
    }
}
