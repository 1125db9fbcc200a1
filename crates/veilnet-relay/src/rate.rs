//! Per-client forwarding rate limits.

use std::time::{Duration, Instant};

/// Fixed-window rate limiter for one client's forwarded messages
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    window_start: Instant,
    count: usize,
}

impl RateLimiter {
    /// Allow `limit` messages per `window`
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record one message; returns false when over the ceiling
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= self.limit {
            return false;
        }
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));

        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn test_window_resets() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(10));

        assert!(limiter.check());
        assert!(!limiter.check());

        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check());
    }
}
