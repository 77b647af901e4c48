//! Retry logic with exponential backoff for transient transfer failures.
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - temporary failures that may succeed on retry
//! - [`FailureType::RateLimited`] - server rate limiting (retries with backoff)
//! - [`FailureType::Integrity`] - size/checksum mismatch (retryable, forces a
//!   restart from offset 0 since the resume assumption is suspect)
//! - [`FailureType::NeedsAuth`] - authentication required (not retryable)
//! - [`FailureType::Permanent`] - failures retries cannot help
//!
//! The [`RetryPolicy`] then decides based on failure type and the task's
//! persisted attempt count, so a process restart continues counting instead
//! of handing the task a fresh budget.
//!
//! # Example
//!
//! ```
//! use coursegrab_core::download::{
//!     DownloadError, RetryPolicy, RetryDecision, classify_error,
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/v.mp4", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeout, connection reset, 5xx server errors.
    Transient,

    /// Server rate limiting (HTTP 429). Retries honour Retry-After.
    RateLimited,

    /// The streamed artifact failed size or checksum validation.
    ///
    /// Retryable, but the next attempt must restart from offset 0 because
    /// the partial bytes on disk can no longer be trusted.
    Integrity,

    /// Authentication or authorization required.
    ///
    /// Credentials are a caller concern; retrying without them cannot help.
    NeedsAuth,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, 400, invalid URL, local file system errors.
    Permanent,
}

impl FailureType {
    /// Returns true when the next attempt must discard partial bytes.
    #[must_use]
    pub fn forces_restart(&self) -> bool {
        matches!(self, Self::Integrity)
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay) + jitter
/// ```
///
/// where jitter is drawn uniformly from `[0, delay)` to desynchronize
/// concurrent retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per task, including the initial attempt.
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap (before jitter).
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Creates a policy with a custom attempt budget, defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether a failed attempt is retried.
    ///
    /// `attempt` is the 1-indexed attempt that just failed, read from the
    /// task's persisted resume record.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - retry without credentials would not help"
                        .to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited | FailureType::Integrity => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the backoff delay for a retry, including jitter.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base_ms = self.base_delay.as_millis() as f64;
        // attempt is 1-indexed: the first retry waits 1x base.
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * 2f64.powf(exponent);

        #[allow(clippy::cast_precision_loss)]
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + jitter_for(capped)
    }
}

/// Draws jitter uniformly from `[0, delay)`.
///
/// Full-range jitter desynchronizes workers that failed at the same moment
/// (e.g. a shared upstream outage) better than a small fixed window.
fn jitter_for(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis();
    if delay_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    #[allow(clippy::cast_possible_truncation)]
    let jitter_ms = rng.gen_range(0..delay_ms as u64);
    Duration::from_millis(jitter_ms)
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 400 | Permanent | Bad request - won't succeed on retry |
/// | 401/403/407 | NeedsAuth | Credentials are a caller concern |
/// | 404 | Permanent | Resource doesn't exist |
/// | 408 | Transient | Request timeout - may succeed |
/// | 410 | Permanent | Permanently removed |
/// | 416 | Transient | Range rejected - executor restarts from 0 |
/// | 429 | RateLimited | Retry with backoff / Retry-After |
/// | 5xx | Transient | Server may recover |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } => FailureType::Transient,

        DownloadError::Network { .. } => FailureType::Transient,

        DownloadError::Integrity { .. } | DownloadError::ChecksumMismatch { .. } => {
            FailureType::Integrity
        }

        DownloadError::AuthRequired { .. } => FailureType::NeedsAuth,

        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => FailureType::Permanent,

        // Persistence failures degrade resume guarantees but the transfer
        // itself may still succeed; treat as transient.
        DownloadError::Store(_) => FailureType::Transient,
    }
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        407 => FailureType::NeedsAuth,   // Proxy Authentication Required
        408 => FailureType::Transient,   // Request Timeout
        410 => FailureType::Permanent,   // Gone
        416 => FailureType::Transient,   // Range Not Satisfiable
        429 => FailureType::RateLimited, // Too Many Requests

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        _ => FailureType::Permanent,
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats: integer seconds and HTTP-date. Returns
/// `None` for unparseable values; caps excessive values at 1 hour.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(header_value, "Retry-After date in the past, returning zero");
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
