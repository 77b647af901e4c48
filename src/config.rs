//! Engine configuration.
//!
//! [`EngineConfig`] carries every option the engine recognizes. The values
//! are owned by an external loader (CLI flags, environment, whatever the
//! caller uses); this module only defines the shape, the defaults, and the
//! range validation applied before a run starts.

use std::time::Duration;

use thiserror::Error;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 10;

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Minimum allowed retry attempts.
const MIN_RETRY_ATTEMPTS: u32 = 1;

/// Maximum allowed retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Default maximum attempts per task (including the initial attempt).
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default connect timeout per request.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default read timeout per request.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between debounced status flushes.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Default byte delta that forces a status flush regardless of interval.
const DEFAULT_FLUSH_BYTES: u64 = 1024 * 1024;

/// Error type for configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Concurrency outside the supported range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Retry attempts outside the supported range.
    #[error(
        "invalid retry_attempts value {value}: must be between {MIN_RETRY_ATTEMPTS} and {MAX_RETRY_ATTEMPTS}"
    )]
    InvalidRetryAttempts {
        /// The invalid value that was provided.
        value: u32,
    },
}

/// Configuration consumed by the transfer engine.
///
/// Constructed by the caller (typically from an external config loader) and
/// validated once before the engine run begins.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers (1-10).
    pub concurrency: usize,

    /// Maximum attempts per task, including the initial attempt (1-10).
    pub retry_attempts: u32,

    /// Connection establishment timeout for each request.
    pub connect_timeout: Duration,

    /// Read timeout for each request.
    pub read_timeout: Duration,

    /// Global throughput ceiling in bytes per second. `None` means unlimited.
    pub rate_limit: Option<u64>,

    /// Delay applied before each worker starts a newly dequeued task.
    pub start_delay: Duration,

    /// Whether completed artifacts are verified (size, checksum).
    pub validate_downloads: bool,

    /// Whether partial files are resumed with byte-range requests.
    pub resume_enabled: bool,

    /// Minimum interval between debounced progress flushes.
    pub flush_interval: Duration,

    /// Byte delta since the last flush that forces a progress flush.
    pub flush_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            rate_limit: None,
            start_delay: Duration::ZERO,
            validate_downloads: true,
            resume_enabled: true,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_bytes: DEFAULT_FLUSH_BYTES,
        }
    }
}

impl EngineConfig {
    /// Validates all range-constrained options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConcurrency`] or
    /// [`ConfigError::InvalidRetryAttempts`] when a value falls outside its
    /// supported range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        if !(MIN_RETRY_ATTEMPTS..=MAX_RETRY_ATTEMPTS).contains(&self.retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.retry_attempts,
            });
        }
        Ok(())
    }
}
