//! Per-client token bucket rate limiter.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One client's bucket.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum tokens a bucket holds.
    burst: f64,
    /// Tokens refilled per second.
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter that allows `requests_per_second` on average and
    /// bursts of up to `burst` requests.
    #[must_use]
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            burst: f64::from(burst.max(1)),
            refill_rate: requests_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token from `key`'s bucket.
    ///
    /// # Errors
    ///
    /// Returns how long to wait until a token is available if the bucket is empty.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.refill_rate, bucket.tokens).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let wait = saturating_secs((1.0 - bucket.tokens) / self.refill_rate);
            warn!(client = %key, retry_after = ?wait, "Rate limit exceeded");
            return Err(wait);
        }

        bucket.tokens -= 1.0;
        Ok(())
    }

    /// Drops buckets that have refilled completely and been idle for `idle`.
    ///
    /// Returns the number of buckets removed.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        let full_after = saturating_secs(self.burst / self.refill_rate);
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle.max(full_after));
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "Pruned idle rate limit buckets");
        }
        removed
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Tiny refill rates produce waits far beyond what `Duration` can hold.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
