//! Continuous token-bucket rate limiting, one bucket per key.

use std::{collections::HashMap, sync::Mutex};

use tokio::time::Instant;
use tracing::warn;

use crate::{config::RateLimitSettings, errors::AppError};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Deducts `amount` tokens, or returns the estimated wait in milliseconds
    /// until that many would be available.
    pub fn consume(&mut self, amount: f64) -> Result<(), u64> {
        if self.tokens >= amount {
            self.tokens -= amount;
            return Ok(());
        }

        let missing = amount - self.tokens;
        let wait_ms = (missing / self.refill_rate * 1_000.0).ceil();
        Err((wait_ms as u64).max(1))
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn last_refill(&self) -> Instant {
        self.last_refill
    }
}

/// Owns one [`TokenBucket`] per key. Buckets are created lazily on first use.
///
/// The bucket map is bounded: once `max_buckets` keys exist, the key that was
/// checked least recently is dropped to make room.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    max_buckets: usize,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            capacity: settings.capacity,
            refill_rate: settings.refill_per_sec,
            max_buckets: settings.max_buckets.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Checks for a single token.
    pub fn check(&self, key: &str) -> Result<(), AppError> {
        self.check_n(key, 1.0)
    }

    /// Refills the key's bucket, then takes `amount` tokens or fails with a
    /// rate-limit error carrying the wait estimate. Never sleeps.
    pub fn check_n(&self, key: &str, amount: f64) -> Result<(), AppError> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !buckets.contains_key(key) && buckets.len() >= self.max_buckets {
            let stale = buckets
                .iter()
                .min_by_key(|(_, bucket)| bucket.last_refill())
                .map(|(stale_key, _)| stale_key.clone());
            if let Some(stale) = stale {
                buckets.remove(&stale);
            }
        }

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));
        bucket.refill(now);
        bucket.consume(amount).map_err(|wait_ms| {
            warn!(key = %key, wait_ms, "rate limit exceeded");
            AppError::rate_limited(key, wait_ms)
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::errors::RATE_LIMIT_EXCEEDED;

    fn limiter(capacity: f64, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(&RateLimitSettings {
            capacity,
            refill_per_sec,
            max_buckets: 16,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn drains_then_refills() {
        let limiter = limiter(3.0, 2.0);
        for _ in 0..3 {
            limiter.check("maps_geocode").expect("within capacity");
        }

        let err = limiter.check("maps_geocode").expect_err("bucket empty");
        let AppError::Domain { code, context, .. } = err else {
            panic!("expected domain error");
        };
        assert_eq!(code, RATE_LIMIT_EXCEEDED);
        let wait = context.expect("context")["retryAfterMs"]
            .as_u64()
            .expect("wait hint");
        assert!(wait > 0);
        assert!(wait <= 500);

        tokio::time::advance(Duration::from_millis(500)).await;
        limiter.check("maps_geocode").expect("refilled");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_have_independent_buckets() {
        let limiter = limiter(1.0, 1.0);
        limiter.check("maps_geocode").expect("first key");
        limiter.check("maps_elevation").expect("second key");
        assert!(limiter.check("maps_geocode").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2.0, 10.0);
        bucket.consume(2.0).expect("full bucket");

        tokio::time::advance(Duration::from_secs(60)).await;
        bucket.refill(Instant::now());

        assert_eq!(bucket.available(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_estimate_rounds_up() {
        let mut bucket = TokenBucket::new(1.0, 3.0);
        bucket.consume(1.0).expect("full bucket");

        // 1 token at 3/s is 333.33 ms.
        assert_eq!(bucket.consume(1.0), Err(334));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_map_is_bounded() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            capacity: 1.0,
            refill_per_sec: 1.0,
            max_buckets: 2,
        });

        limiter.check("a").expect("a");
        tokio::time::advance(Duration::from_millis(10)).await;
        limiter.check("b").expect("b");
        tokio::time::advance(Duration::from_millis(10)).await;
        limiter.check("c").expect("c");

        assert_eq!(limiter.bucket_count(), 2);
        // "a" was evicted and comes back with a fresh, full bucket.
        limiter.check("a").expect("a again");
    }
}
