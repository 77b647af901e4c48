//! Resilient parallel transfer engine.
//!
//! This module contains everything between "here is a list of tasks" and
//! "every task reached a terminal state":
//!
//! - [`engine`] - worker pool, task queue, retry loop, run summary
//! - [`transfer`] - one resumable streaming attempt
//! - [`client`] - HTTP wrapper with timeouts and range requests
//! - [`rate_limiter`] - aggregate byte-throughput token bucket
//! - [`retry`] - failure classification and backoff policy
//! - [`validator`] - size/checksum verification and idempotent skip
//! - [`error`] - the [`DownloadError`] taxonomy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coursegrab_core::{
//!     ContentCategory, DownloadEngine, DownloadTask, EngineConfig, EngineContext, NullSink,
//!     ResolverRegistry, StatusStore,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let store = StatusStore::open("status.json", config.flush_interval, config.flush_bytes)?;
//! let ctx = Arc::new(EngineContext::new(
//!     config,
//!     store,
//!     ResolverRegistry::new(),
//!     Arc::new(NullSink),
//! ));
//! let engine = DownloadEngine::new(ctx)?;
//!
//! let task = DownloadTask::new(
//!     "lesson-1",
//!     "https://example.com/lesson-1.mp4",
//!     "/courses/lesson-1.mp4",
//!     ContentCategory::Video,
//! );
//! engine.submit(vec![task]).await?;
//! let summary = engine.run().await;
//! assert!(summary.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod rate_limiter;
pub mod retry;
pub mod transfer;
pub mod validator;

pub use client::HttpClient;
pub use engine::{
    DownloadEngine, EngineContext, EngineError, FailedTask, RunSummary, TaskQueue,
};
pub use error::DownloadError;
pub use rate_limiter::RateLimiter;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
pub use transfer::{AttemptOutcome, TransferExecutor};
pub use validator::{Validator, Verified, compute_sha256};
