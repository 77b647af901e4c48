//! Progress event emission.
//!
//! The engine reports state transitions and debounced byte-progress updates
//! through a [`ProgressSink`]. The core has no opinion on rendering; a CLI
//! collaborator might drive a progress bar, a GUI might forward events over a
//! channel, and tests collect them into a vector.

use chrono::{DateTime, Utc};

use crate::status::TransferStatus;

/// A single progress observation for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// The task this event describes.
    pub task_id: String,
    /// Status at the time of the event.
    pub status: TransferStatus,
    /// Bytes physically written so far.
    pub bytes_downloaded: u64,
    /// Total expected bytes, when known.
    pub total_bytes: Option<u64>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl TransferEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn now(
        task_id: impl Into<String>,
        status: TransferStatus,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            bytes_downloaded,
            total_bytes,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver for engine progress events.
///
/// Implementations must not block: the engine calls `emit` from worker tasks
/// on every state transition and on each debounced progress tick.
pub trait ProgressSink: Send + Sync {
    /// Delivers one event to the consumer.
    fn emit(&self, event: TransferEvent);
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}
