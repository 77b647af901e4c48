//! Coursegrab Core Library
//!
//! This library provides the resilient parallel transfer engine used to fetch
//! the files of an online-course content tree (videos, documents, audio,
//! markup) and write them to local storage, resuming after interruption and
//! respecting server-imposed rate limits.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Engine configuration and validation
//! - [`task`] - Immutable download task descriptions
//! - [`status`] - Crash-safe persisted transfer state
//! - [`download`] - Transfer executor, worker pool, rate limiting, retry
//! - [`resolver`] - Content-category URL resolution registry
//! - [`events`] - Progress event emission
//!
//! Task enumeration, credential acquisition, and progress rendering are
//! collaborator concerns; the engine consumes a task list and emits events.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod events;
pub mod resolver;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, DEFAULT_CONCURRENCY, DEFAULT_RETRY_ATTEMPTS};
pub use download::{
    AttemptOutcome, DownloadEngine, DownloadError, EngineContext, EngineError, FailedTask,
    FailureType, HttpClient, RateLimiter, RetryDecision, RetryPolicy, RunSummary, TaskQueue,
    Validator, classify_error,
};
pub use events::{NullSink, ProgressSink, TransferEvent};
pub use resolver::{DirectResolver, ResolvedTransfer, ResolverRegistry, UrlResolver};
pub use status::{ResumeRecord, StatusStore, StoreError, TransferStatus};
pub use task::{ContentCategory, DownloadTask};
