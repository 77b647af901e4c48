//! Transfer status and resume record types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one transfer.
///
/// Transitions: `Queued → InProgress → {Completed, Failed, Paused, Skipped}`.
/// `Paused` re-enters `InProgress` when the task is dequeued again. `Skipped`
/// is terminal and only set at submission time when a prior validated
/// `Completed` record exists. `Failed` is terminal for the run but a later
/// run may resubmit the same task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting to be dequeued by a worker.
    Queued,
    /// A worker is actively transferring bytes.
    InProgress,
    /// Streamed fully and validated.
    Completed,
    /// Retry budget exhausted or non-retryable error.
    Failed,
    /// Stopped cooperatively; partial bytes preserved on disk.
    Paused,
    /// Prior completed artifact re-validated at submission; no work needed.
    Skipped,
}

impl TransferStatus {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true for states that end a run for this task.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Paused | Self::Skipped
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid transfer status: {s}")),
        }
    }
}

/// Persisted state describing one task's transfer progress and outcome.
///
/// Invariant: a record only reads `Completed` if, at the moment it was
/// written, the on-disk artifact's size (and checksum, when configured)
/// matched the expected values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Current transfer status.
    pub status: TransferStatus,

    /// Bytes physically written to the destination file.
    pub bytes_downloaded: u64,

    /// Expected total bytes, once known.
    pub total_bytes: Option<u64>,

    /// Hex-encoded SHA-256 of the completed artifact, once computed.
    pub checksum: Option<String>,

    /// Attempts consumed so far, carried across process restarts.
    pub attempt_count: u32,

    /// Time of the last update to this record.
    pub updated_at: DateTime<Utc>,

    /// Last error observed, if any.
    pub last_error: Option<String>,
}

impl ResumeRecord {
    /// Creates a fresh `Queued` record for a task seen for the first time.
    #[must_use]
    pub fn queued() -> Self {
        Self {
            status: TransferStatus::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            checksum: None,
            attempt_count: 0,
            updated_at: Utc::now(),
            last_error: None,
        }
    }
}
