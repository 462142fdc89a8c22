//! Per-identity token bucket admission control.
//!
//! Refill is continuous and fractional; drain is one token per accepted
//! request regardless of batch size. The bucket is checked and drained
//! atomically under its per-identity lock, so a batch is never partially
//! admitted and identities never contend with each other.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl RateLimiterConfig {
    /// Rate expressed per minute, as configured.
    pub fn per_minute(rate_per_minute: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst.max(1)),
            refill_per_sec: f64::from(rate_per_minute) / 60.0,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimiterConfig, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, config: &RateLimiterConfig, now: Instant) -> Result<f64, ()> {
        self.refill(config, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens)
        } else {
            Err(())
        }
    }
}

/// Admission decision for an allowed request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
}

/// Rejection carrying the Retry-After the client should honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    /// Retry-After surfaced on rejection: the refill window.
    window_secs: u64,
    buckets: RwLock<HashMap<String, Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        Self {
            config: RateLimiterConfig::per_minute(rate_per_minute, burst),
            window_secs: 60,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, identity: &str) -> Result<RateLimitInfo, RateLimitExceeded> {
        self.try_acquire_at(identity, Instant::now())
    }

    pub fn try_acquire_at(
        &self,
        identity: &str,
        now: Instant,
    ) -> Result<RateLimitInfo, RateLimitExceeded> {
        {
            let buckets = self.buckets.read().expect("rate limiter poisoned");
            if let Some(bucket) = buckets.get(identity) {
                return self.consume(bucket, now);
            }
        }

        let mut buckets = self.buckets.write().expect("rate limiter poisoned");
        let bucket = buckets
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(&self.config, now)));
        self.consume(bucket, now)
    }

    fn consume(
        &self,
        bucket: &Mutex<TokenBucket>,
        now: Instant,
    ) -> Result<RateLimitInfo, RateLimitExceeded> {
        let mut bucket = bucket.lock().expect("token bucket poisoned");
        match bucket.try_consume(&self.config, now) {
            Ok(remaining) => Ok(RateLimitInfo {
                limit: self.config.capacity as u32,
                remaining: remaining as u32,
            }),
            Err(()) => Err(RateLimitExceeded {
                retry_after_secs: self.window_secs,
            }),
        }
    }

    /// Evict buckets idle for longer than `idle_for`. Returns the count
    /// removed. Run periodically to bound memory across identities.
    pub fn sweep_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write().expect("rate limiter poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("token bucket poisoned");
            now.duration_since(bucket.last_refill) < idle_for
        });
        let removed = before - buckets.len();
        if removed > 0 {
            info!(removed, "evicted idle rate-limit buckets");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_capacity_is_honored_then_exhausted() {
        let limiter = RateLimiter::new(60, 5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at("client", now).is_ok());
        }
        let rejected = limiter.try_acquire_at("client", now).expect_err("empty bucket");
        assert_eq!(rejected.retry_after_secs, 60);
    }

    #[test]
    fn refill_is_continuous_and_fractional() {
        // 60 per minute = 1 token per second.
        let limiter = RateLimiter::new(60, 1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at("client", start).is_ok());
        assert!(limiter.try_acquire_at("client", start).is_err());
        // Half a token after 500ms: still rejected.
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(500))
            .is_err());
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(1001))
            .is_ok());
    }

    #[test]
    fn identities_do_not_contend() {
        let limiter = RateLimiter::new(60, 1);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now).is_ok());
        assert!(limiter.try_acquire_at("a", now).is_err());
        assert!(limiter.try_acquire_at("b", now).is_ok());
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new(1000, 1000);
        let now = Instant::now();
        let info = limiter.try_acquire_at("client", now).expect("allowed");
        assert_eq!(info.limit, 1000);
        assert_eq!(info.remaining, 999);
    }

    #[test]
    fn steady_state_admits_refill_rate() {
        // 1000 rpm emptied instantly, then one admit per refill interval.
        let limiter = RateLimiter::new(1000, 10);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(limiter.try_acquire_at("client", start).is_ok());
        }
        assert!(limiter.try_acquire_at("client", start).is_err());
        // 1000/min is one token per 60ms.
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(61))
            .is_ok());
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(62))
            .is_err());
    }

    #[test]
    fn idle_buckets_are_swept() {
        let limiter = RateLimiter::new(60, 1);
        let _ = limiter.try_acquire("stale");
        assert_eq!(limiter.sweep_idle(Duration::from_secs(0)), 1);
        assert_eq!(limiter.sweep_idle(Duration::from_secs(3600)), 0);
    }
}
