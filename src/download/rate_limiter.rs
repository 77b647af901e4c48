//! Global byte-throughput rate limiting.
//!
//! One [`RateLimiter`] token bucket is shared by every worker in a run: the
//! configured rate is an aggregate ceiling, not a per-worker budget. The
//! bucket refills continuously at the configured bytes/second and its
//! capacity is capped at one second of throughput to bound burstiness.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use coursegrab_core::download::RateLimiter;
//!
//! # async fn example() {
//! // 1 MiB/s shared across all workers
//! let limiter = Arc::new(RateLimiter::new(1024 * 1024));
//!
//! // Blocks until the bucket can cover the chunk
//! limiter.acquire(8192).await;
//! # }
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Mutable bucket state, guarded by a Mutex for atomic refill-and-debit.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket granting byte-sized spends against a global throughput cap.
///
/// Designed to be wrapped in `Arc` and shared across worker tasks. Waiters
/// are served in lock-acquisition order; there is no per-worker fairness
/// beyond that, which is acceptable for the bounded worker counts (≤10) the
/// engine allows.
#[derive(Debug)]
pub struct RateLimiter {
    /// Refill rate and bucket capacity, in bytes per second.
    rate: Option<u64>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with the given aggregate ceiling in bytes/second.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: Some(bytes_per_sec.max(1)),
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a limiter that grants every acquire immediately.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            rate: None,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Builds from an optional configured rate (`None` = unlimited).
    #[must_use]
    pub fn from_config(rate_limit: Option<u64>) -> Self {
        match rate_limit {
            Some(rate) => Self::new(rate),
            None => Self::unlimited(),
        }
    }

    /// Returns whether a throughput ceiling is configured.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.rate.is_some()
    }

    /// Blocks until the bucket can cover `n_bytes`, then debits them.
    ///
    /// When the bucket is short, the waiter drains it to zero, advances the
    /// refill clock past the deficit, and sleeps for the computed wait. A
    /// request larger than one second of tokens therefore still completes;
    /// it just pays the proportional wait up front.
    #[instrument(skip(self), level = "trace")]
    pub async fn acquire(&self, n_bytes: u64) {
        let Some(rate) = self.rate else {
            return;
        };
        if n_bytes == 0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let rate_f = rate as f64;
        #[allow(clippy::cast_precision_loss)]
        let need = n_bytes as f64;

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            // Capacity is capped at one second of throughput.
            bucket.tokens = (bucket.tokens + elapsed * rate_f).min(rate_f);
            bucket.last_refill = now;

            if bucket.tokens >= need {
                bucket.tokens -= need;
                None
            } else {
                let wait = Duration::from_secs_f64((need - bucket.tokens) / rate_f);
                bucket.tokens = 0.0;
                // Advance the clock past the deficit so the next waiter does
                // not double-spend the tokens this grant consumed.
                bucket.last_refill = now + wait;
                Some(wait)
            }
        };

        if let Some(wait) = wait {
            debug!(n_bytes, wait_ms = wait.as_millis(), "rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }
}
