//! Rate limiters (optional, §6): a fallible `consume(key)` contract. Failure
//! is sufficient grounds for the caller to reject — the hub never inspects
//! *why* a limiter refused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::connection::now_ms;

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// `true` if the call is allowed to proceed.
    async fn consume(&self, key: &str) -> bool;
}

struct Bucket {
    tokens: f64,
    last_refill_at: i64,
}

/// A simple per-key token bucket: the reference realization of
/// "consume-or-fail" that needs no external service, while remaining
/// swappable for a real distributed limiter.
pub struct TokenBucketRateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketRateLimiter {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self { capacity, refill_per_second, buckets: Mutex::new(HashMap::new()) }
    }
}

#[async_trait::async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn consume(&self, key: &str) -> bool {
        let now = now_ms();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| Bucket { tokens: self.capacity, last_refill_at: now });

        let elapsed_secs = Duration::from_millis((now - bucket.last_refill_at).max(0) as u64).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed_secs * self.refill_per_second).min(self.capacity);
        bucket.last_refill_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_rejects() {
        let limiter = TokenBucketRateLimiter::new(2.0, 0.0);
        assert!(limiter.consume("acct-1").await);
        assert!(limiter.consume("acct-1").await);
        assert!(!limiter.consume("acct-1").await);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_key() {
        let limiter = TokenBucketRateLimiter::new(1.0, 0.0);
        assert!(limiter.consume("acct-1").await);
        assert!(limiter.consume("acct-2").await);
        assert!(!limiter.consume("acct-1").await);
    }
}
