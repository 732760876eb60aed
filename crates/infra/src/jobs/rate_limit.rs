//! Token bucket sized to the analysis service's per-minute quota.

use std::time::{Duration, Instant};

/// Classic token bucket.
///
/// Holds at most `capacity` tokens and refills `capacity` tokens per minute,
/// proportionally to elapsed time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket for `requests_per_minute`.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::with_rate(requests_per_minute, Duration::from_secs(60))
    }

    /// A full bucket that refills `capacity` tokens every `period`.
    pub fn with_rate(capacity: u32, period: Duration) -> Self {
        let capacity = f64::from(capacity);
        let period = period.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / period,
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill(&mut self) {
        self.refill_at(Instant::now());
    }

    pub fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Whether a whole token is available.
    pub fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        if self.has_token() {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let mut bucket = TokenBucket::per_minute(3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(!bucket.has_token());
    }

    #[test]
    fn refills_proportionally_and_caps_at_capacity() {
        let mut bucket = TokenBucket::per_minute(60);
        let start = bucket.last_refill;
        while bucket.try_acquire() {}

        bucket.refill_at(start + Duration::from_secs(5));
        assert!((bucket.available() - 5.0).abs() < 1e-6);

        bucket.refill_at(start + Duration::from_secs(600));
        assert!((bucket.available() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn zero_quota_never_grants() {
        let mut bucket = TokenBucket::per_minute(0);
        bucket.refill();
        assert!(!bucket.try_acquire());
    }
}
