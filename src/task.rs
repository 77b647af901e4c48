//! Download task types.
//!
//! A [`DownloadTask`] is the immutable unit of work handed to the engine by
//! the task-enumeration collaborator. The engine never mutates a task; all
//! mutable state lives in the persisted [`crate::status::ResumeRecord`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Category of course content a task belongs to.
///
/// Used by the [`crate::resolver::ResolverRegistry`] to pick a URL resolver;
/// provider-specific negotiation (e.g. selecting a video rendition) hangs off
/// this tag rather than being branched centrally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    /// Streaming video lesson.
    Video,
    /// PDF or other downloadable document.
    Document,
    /// Audio lesson.
    Audio,
    /// HTML/text content saved as markup.
    Markup,
    /// Caption/subtitle track attached to a video.
    Subtitle,
    /// Anything the enumerator could not classify.
    Other,
}

impl ContentCategory {
    /// Returns the snake_case string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Markup => "markup",
            Self::Subtitle => "subtitle",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable description of one file to fetch and where to place it.
///
/// Created and owned by the external task-enumeration collaborator. Task
/// identity for idempotency purposes is the `id` plus `dest_path` pair: the
/// same id resubmitted against the same destination in a later run maps to
/// the same resume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique, stable identifier for this task.
    pub id: String,

    /// Source URL (possibly indirect; resolvers may replace it).
    pub url: String,

    /// Destination path on local storage.
    pub dest_path: PathBuf,

    /// Expected size in bytes, when the enumerator knows it.
    pub expected_size: Option<u64>,

    /// Expected hex-encoded SHA-256 checksum, when known in advance.
    pub expected_checksum: Option<String>,

    /// Content category tag for resolver dispatch.
    pub category: ContentCategory,

    /// Scheduling priority; higher values are dequeued first.
    pub priority: i64,

    /// Request headers required by the origin (auth cookies etc.).
    pub headers: Vec<(String, String)>,
}

impl DownloadTask {
    /// Creates a task with default priority and no expectations.
    ///
    /// Convenience for callers that only have a URL and a destination;
    /// enumerators with richer metadata construct the struct directly.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        category: ContentCategory,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            dest_path: dest_path.into(),
            expected_size: None,
            expected_checksum: None,
            category,
            priority: 0,
            headers: Vec::new(),
        }
    }
}
