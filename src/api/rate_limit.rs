//! Token-bucket rate limiting for the management API.
//!
//! One process-wide bucket: the budget is `per_minute` requests,
//! refilled continuously, with bursts up to the full budget.

use parking_lot::Mutex;
use std::time::Instant;

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        RateLimiter {
            bucket: Mutex::new(TokenBucket::new(per_minute)),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_acquire()
    }
}

struct TokenBucket {
    available: f64,
    max: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let max = f64::from(per_minute);
        TokenBucket {
            available: max,
            max,
            refill_per_sec: max / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.refill_per_sec).min(self.max);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allows_bursts_up_to_the_budget() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(60); // one token per second
        bucket.available = 0.0;
        assert!(!bucket.try_acquire());

        bucket.last_refill = Instant::now() - Duration::from_secs(2);
        assert!(bucket.try_acquire());
    }

    #[test]
    fn zero_budget_denies_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.try_acquire());
    }
}
