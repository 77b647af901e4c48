//! Single-attempt transfer execution.
//!
//! A [`TransferExecutor`] drives exactly one resumable attempt for one task:
//! resolve the target, pick a resume offset, stream the body to disk under
//! the rate limiter, persist debounced progress, and validate the result.
//! Every exit path is a tagged [`AttemptOutcome`]; the engine's retry loop
//! decides what happens next, never this module.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::events::TransferEvent;
use crate::status::TransferStatus;
use crate::task::DownloadTask;

use super::engine::EngineContext;
use super::retry::{FailureType, classify_error};
use super::{DownloadError, HttpClient};

/// Result of one transfer attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The artifact streamed fully and passed validation.
    Completed {
        /// Final artifact size in bytes.
        bytes: u64,
        /// Total expected bytes, when the server reported one.
        total: Option<u64>,
        /// Hex-encoded SHA-256, when validation computed one.
        checksum: Option<String>,
    },

    /// The cooperative stop flag interrupted the stream at a chunk boundary.
    ///
    /// Partial bytes stay on disk for a later resume.
    Paused {
        /// Bytes on disk at the pause point.
        bytes: u64,
    },

    /// The attempt failed in a way retries may fix.
    Retryable(DownloadError),

    /// The attempt failed in a way retries cannot fix.
    Fatal(DownloadError),
}

impl AttemptOutcome {
    /// Wraps an error as `Retryable` or `Fatal` based on its classification.
    fn from_error(error: DownloadError) -> Self {
        match classify_error(&error) {
            FailureType::NeedsAuth | FailureType::Permanent => Self::Fatal(error),
            FailureType::Transient | FailureType::RateLimited | FailureType::Integrity => {
                Self::Retryable(error)
            }
        }
    }
}

/// Runs one resumable attempt for one task against shared engine state.
#[derive(Debug)]
pub struct TransferExecutor {
    ctx: Arc<EngineContext>,
    client: HttpClient,
}

impl TransferExecutor {
    /// Creates an executor over the shared context and a prepared client.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, client: HttpClient) -> Self {
        Self { ctx, client }
    }

    /// Executes one attempt for the task.
    ///
    /// `force_restart` discards any partial file first; the retry loop sets
    /// it after an integrity failure, when the partial bytes are suspect.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn attempt(&self, task: &DownloadTask, force_restart: bool) -> AttemptOutcome {
        if self.ctx.stop_requested() {
            let bytes = tokio::fs::metadata(&task.dest_path)
                .await
                .map_or(0, |m| m.len());
            debug!(bytes, "stop requested before attempt, pausing");
            return AttemptOutcome::Paused { bytes };
        }

        let mut offset = self.resume_offset(task, force_restart).await;

        // A partial that already spans the whole artifact needs no request;
        // validation decides whether it stands.
        if offset > 0 && task.expected_size == Some(offset) {
            debug!(offset, "partial file already complete, validating");
            return match self.ctx.validator.verify(task, &task.dest_path).await {
                Ok(verified) => AttemptOutcome::Completed {
                    bytes: verified.size,
                    total: Some(verified.size),
                    checksum: verified.checksum,
                },
                Err(error) => AttemptOutcome::from_error(error),
            };
        }

        let resolved = match self.ctx.resolvers.resolve(task).await {
            Ok(resolved) => resolved,
            Err(error) => return AttemptOutcome::from_error(error),
        };

        let response = match self
            .client
            .get(&resolved.url, &resolved.headers, offset)
            .await
        {
            Ok(response) => response,
            // The origin rejected our byte range outright; treat resume as
            // unsupported and re-issue the same attempt from the start.
            Err(DownloadError::HttpStatus { status: 416, .. }) if offset > 0 => {
                warn!(offset, "range not satisfiable, restarting from 0");
                offset = 0;
                match self.client.get(&resolved.url, &resolved.headers, 0).await {
                    Ok(response) => response,
                    Err(error) => return AttemptOutcome::from_error(error),
                }
            }
            Err(error) => return AttemptOutcome::from_error(error),
        };

        // A 200 answer to a ranged request carries the full body; appending
        // it after the partial bytes would corrupt the file.
        if offset > 0 && response.status() == StatusCode::OK {
            warn!(offset, "server ignored range request, restarting from 0");
            offset = 0;
        }

        let total = match response.content_length() {
            Some(remaining) => Some(offset + remaining),
            None => task.expected_size,
        };

        let mut file = match open_dest(&task.dest_path, offset).await {
            Ok(file) => file,
            Err(error) => return AttemptOutcome::from_error(error),
        };

        debug!(offset, ?total, "streaming transfer");

        let mut bytes_written = offset;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if self.ctx.stop_requested() {
                if let Err(error) = file.flush().await {
                    return AttemptOutcome::from_error(DownloadError::io(&task.dest_path, error));
                }
                debug!(bytes_written, "stop requested, pausing at chunk boundary");
                return AttemptOutcome::Paused {
                    bytes: bytes_written,
                };
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                // Partial bytes stay on disk; the next attempt resumes.
                Err(error) => {
                    let error = if error.is_timeout() {
                        DownloadError::timeout(&resolved.url)
                    } else {
                        DownloadError::network(&resolved.url, error)
                    };
                    return AttemptOutcome::from_error(error);
                }
            };

            self.ctx.rate_limiter.acquire(chunk.len() as u64).await;

            if let Err(error) = file.write_all(&chunk).await {
                return AttemptOutcome::from_error(DownloadError::io(&task.dest_path, error));
            }
            bytes_written += chunk.len() as u64;

            self.persist_progress(task, bytes_written, total);
        }

        if let Err(error) = file.flush().await {
            return AttemptOutcome::from_error(DownloadError::io(&task.dest_path, error));
        }
        drop(file);

        match self.ctx.validator.verify(task, &task.dest_path).await {
            Ok(verified) => AttemptOutcome::Completed {
                bytes: verified.size,
                total: total.or(Some(verified.size)),
                checksum: verified.checksum,
            },
            Err(error) => AttemptOutcome::from_error(error),
        }
    }

    /// Picks the byte offset this attempt starts from.
    ///
    /// An existing partial file no larger than the expected size resumes
    /// where it left off; anything else (oversized partial, resume disabled,
    /// forced restart) starts from 0.
    async fn resume_offset(&self, task: &DownloadTask, force_restart: bool) -> u64 {
        if force_restart || !self.ctx.config.resume_enabled {
            return 0;
        }

        let Ok(meta) = tokio::fs::metadata(&task.dest_path).await else {
            return 0;
        };
        let size = meta.len();

        if let Some(expected) = task.expected_size {
            if size > expected {
                warn!(
                    size,
                    expected, "partial file larger than expected, restarting from 0"
                );
                return 0;
            }
        }
        size
    }

    /// Updates the resume record with a debounced flush and emits a progress
    /// event when a flush actually happened.
    ///
    /// Persistence failures degrade resume guarantees but never fail the
    /// transfer; they are logged and the attempt continues in memory.
    fn persist_progress(&self, task: &DownloadTask, bytes_written: u64, total: Option<u64>) {
        let flushed = {
            let mut store = self.ctx.lock_store();
            match store.record_progress(&task.id, bytes_written, total) {
                Ok(flushed) => flushed,
                Err(error) => {
                    warn!(error = %error, "progress persistence failed, continuing in memory");
                    false
                }
            }
        };

        if flushed {
            self.ctx.sink.emit(TransferEvent::now(
                &task.id,
                TransferStatus::InProgress,
                bytes_written,
                total,
            ));
        }
    }
}

/// Opens the destination for writing: append mode when resuming, truncating
/// otherwise. Creates missing parent directories.
async fn open_dest(path: &Path, offset: u64) -> Result<File, DownloadError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
    }

    let file = if offset > 0 {
        OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?
    } else {
        File::create(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?
    };
    Ok(file)
}
