//! Post-transfer integrity validation and idempotent-skip checks.
//!
//! The validator answers two questions: did a just-finished transfer produce
//! the artifact we expected, and can a previously completed artifact be
//! trusted without re-downloading. Size is always compared when an
//! expectation exists; checksums are compared when validation is enabled and
//! a checksum is expected or recorded.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::status::{ResumeRecord, TransferStatus};
use crate::task::DownloadTask;

use super::DownloadError;

/// Read buffer size for checksum computation.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Result of verifying a completed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// Size of the artifact on disk.
    pub size: u64,
    /// Hex-encoded SHA-256, when validation computed one.
    pub checksum: Option<String>,
}

/// Confirms completed artifacts match expectations.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    enabled: bool,
}

impl Validator {
    /// Creates a validator; `enabled = false` skips all checks.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Returns whether integrity validation is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Verifies a freshly streamed artifact against task expectations.
    ///
    /// - Size differing from `expected_size` (smaller or larger) is an
    ///   [`DownloadError::Integrity`] mismatch; retryable, and the next
    ///   attempt restarts from offset 0.
    /// - A checksum mismatch against `expected_checksum` is a
    ///   [`DownloadError::ChecksumMismatch`], treated the same way.
    /// - With no expected size at all, whatever was streamed is accepted as
    ///   final; the computed size/checksum become the baseline for future
    ///   skip decisions.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the artifact cannot be read, or a
    /// mismatch error as described above.
    #[instrument(skip(self, task), fields(task_id = %task.id, path = %path.display()))]
    pub async fn verify(
        &self,
        task: &DownloadTask,
        path: &Path,
    ) -> Result<Verified, DownloadError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?
            .len();

        if !self.enabled {
            debug!(size, "validation disabled, accepting artifact");
            return Ok(Verified {
                size,
                checksum: None,
            });
        }

        if let Some(expected) = task.expected_size {
            if size != expected {
                warn!(expected, actual = size, "size mismatch");
                return Err(DownloadError::integrity(path, expected, size));
            }
        }

        let checksum = compute_sha256_blocking(path).await?;
        if let Some(expected) = task.expected_checksum.as_deref() {
            if !checksum.eq_ignore_ascii_case(expected) {
                warn!(expected, actual = %checksum, "checksum mismatch");
                return Err(DownloadError::checksum_mismatch(path, expected, checksum));
            }
        }

        debug!(size, checksum = %checksum, "artifact verified");
        Ok(Verified {
            size,
            checksum: Some(checksum),
        })
    }

    /// Decides at submission time whether a task needs no work at all.
    ///
    /// Returns true only if the record is `Completed` and the live file still
    /// matches the recorded size (and checksum, when one was recorded and
    /// validation is enabled). Guards against external tampering or deletion
    /// between runs.
    #[instrument(skip(self, task, record), fields(task_id = %task.id))]
    pub async fn can_skip(&self, task: &DownloadTask, record: &ResumeRecord) -> bool {
        if record.status != TransferStatus::Completed {
            return false;
        }

        let Ok(meta) = tokio::fs::metadata(&task.dest_path).await else {
            debug!("destination missing, cannot skip");
            return false;
        };

        let expected_size = task
            .expected_size
            .or(record.total_bytes)
            .unwrap_or(record.bytes_downloaded);
        if meta.len() != expected_size {
            debug!(
                expected = expected_size,
                actual = meta.len(),
                "size changed since completion, cannot skip"
            );
            return false;
        }

        if self.enabled {
            if let Some(recorded) = record.checksum.as_deref() {
                match compute_sha256_blocking(&task.dest_path).await {
                    Ok(actual) if actual.eq_ignore_ascii_case(recorded) => {}
                    Ok(_) => {
                        debug!("checksum changed since completion, cannot skip");
                        return false;
                    }
                    Err(error) => {
                        warn!(error = %error, "checksum re-check failed, cannot skip");
                        return false;
                    }
                }
            }
        }

        true
    }
}

/// Computes the hex-encoded SHA-256 of a file on the blocking pool.
async fn compute_sha256_blocking(path: &Path) -> Result<String, DownloadError> {
    let owned: PathBuf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || compute_sha256(&owned)).await;
    match result {
        Ok(inner) => inner,
        Err(join_error) => Err(DownloadError::io(
            path,
            std::io::Error::other(join_error),
        )),
    }
}

/// Streams a file through SHA-256 in fixed-size chunks.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if the file cannot be opened or read.
pub fn compute_sha256(path: &Path) -> Result<String, DownloadError> {
    let mut file = std::fs::File::open(path).map_err(|e| DownloadError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use crate::task::ContentCategory;

    use super::*;

    /// SHA-256 of the three bytes `abc`, a fixed test vector.
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn task_with_dest(dir: &TempDir, name: &str) -> DownloadTask {
        DownloadTask::new(
            "t1",
            "https://example.com/f",
            dir.path().join(name),
            ContentCategory::Document,
        )
    }

    fn completed_record(bytes: u64, checksum: Option<&str>) -> ResumeRecord {
        ResumeRecord {
            status: TransferStatus::Completed,
            bytes_downloaded: bytes,
            total_bytes: Some(bytes),
            checksum: checksum.map(str::to_string),
            attempt_count: 1,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    #[test]
    fn test_compute_sha256_known_vector() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(compute_sha256(&path).unwrap(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_verify_accepts_matching_size_and_checksum() {
        let dir = TempDir::new().unwrap();
        let mut task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abc").unwrap();
        task.expected_size = Some(3);
        task.expected_checksum = Some(ABC_SHA256.to_string());

        let verified = Validator::new(true).verify(&task, &task.dest_path).await.unwrap();
        assert_eq!(verified.size, 3);
        assert_eq!(verified.checksum.as_deref(), Some(ABC_SHA256));
    }

    #[tokio::test]
    async fn test_verify_rejects_short_file() {
        let dir = TempDir::new().unwrap();
        let mut task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"ab").unwrap();
        task.expected_size = Some(3);

        let result = Validator::new(true).verify(&task, &task.dest_path).await;
        assert!(matches!(
            result,
            Err(DownloadError::Integrity {
                expected_bytes: 3,
                actual_bytes: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_verify_rejects_oversized_file() {
        let dir = TempDir::new().unwrap();
        let mut task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abcd").unwrap();
        task.expected_size = Some(3);

        let result = Validator::new(true).verify(&task, &task.dest_path).await;
        assert!(matches!(result, Err(DownloadError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_verify_rejects_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abc").unwrap();
        task.expected_checksum = Some("00".repeat(32));

        let result = Validator::new(true).verify(&task, &task.dest_path).await;
        assert!(matches!(result, Err(DownloadError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_verify_no_expectations_records_baseline() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"whatever was streamed").unwrap();

        let verified = Validator::new(true).verify(&task, &task.dest_path).await.unwrap();
        assert_eq!(verified.size, 21);
        assert!(verified.checksum.is_some());
    }

    #[tokio::test]
    async fn test_verify_disabled_skips_checks() {
        let dir = TempDir::new().unwrap();
        let mut task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"ab").unwrap();
        task.expected_size = Some(999);

        let verified = Validator::new(false).verify(&task, &task.dest_path).await.unwrap();
        assert_eq!(verified.size, 2);
        assert!(verified.checksum.is_none());
    }

    #[tokio::test]
    async fn test_can_skip_happy_path() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abc").unwrap();
        let record = completed_record(3, Some(ABC_SHA256));

        assert!(Validator::new(true).can_skip(&task, &record).await);
    }

    #[tokio::test]
    async fn test_can_skip_false_for_non_completed() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abc").unwrap();
        let mut record = completed_record(3, None);
        record.status = TransferStatus::Paused;

        assert!(!Validator::new(true).can_skip(&task, &record).await);
    }

    #[tokio::test]
    async fn test_can_skip_false_when_file_deleted() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "missing.txt");
        let record = completed_record(3, None);

        assert!(!Validator::new(true).can_skip(&task, &record).await);
    }

    #[tokio::test]
    async fn test_can_skip_false_when_file_tampered() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "f.txt");
        // Same length, different content: size passes, checksum catches it.
        std::fs::write(&task.dest_path, b"abX").unwrap();
        let record = completed_record(3, Some(ABC_SHA256));

        assert!(!Validator::new(true).can_skip(&task, &record).await);
    }

    #[tokio::test]
    async fn test_can_skip_false_when_size_changed() {
        let dir = TempDir::new().unwrap();
        let task = task_with_dest(&dir, "f.txt");
        std::fs::write(&task.dest_path, b"abcdef").unwrap();
        let record = completed_record(3, None);

        assert!(!Validator::new(true).can_skip(&task, &record).await);
    }
}
