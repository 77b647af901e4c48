//! Atomic, crash-safe persistence for resume records.
//!
//! The store keeps an ordered map of task id to [`ResumeRecord`] in memory
//! and mirrors it to disk as a single JSON document. Every flush follows the
//! same protocol: copy the current primary document to the backup path, write
//! the new serialization to a temporary file in the same directory, then
//! rename the temporary file over the primary. The rename is atomic on the
//! target filesystem, so a reader never observes a partially written file:
//! either the primary parses, or the backup (one generation older) does.
//!
//! Byte-progress updates are debounced (time- or size-based) to bound write
//! amplification; state transitions always flush immediately.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{ResumeRecord, TransferStatus};

/// Error type for status store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system error while reading or writing a document.
    #[error("IO error on status document {path}: {source}")]
    Io {
        /// The document path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The in-memory map failed to serialize.
    #[error("failed to serialize status document: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Durable mapping of task id to transfer state.
///
/// Single logical writer (the engine's coordinator path); readers receive
/// cloned snapshots via [`snapshot`](Self::snapshot), never references into
/// the mutable map.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    backup_path: PathBuf,
    records: BTreeMap<String, ResumeRecord>,
    flush_interval: Duration,
    flush_bytes: u64,
    last_flush: Instant,
    bytes_since_flush: u64,
}

impl StatusStore {
    /// Opens (or cold-starts) a store backed by the given primary path.
    ///
    /// Recovery order: primary document, then backup, then empty. A missing
    /// or unparsable primary with a usable backup loses at most one flush
    /// generation of progress; losing both is a cold start and is logged as
    /// a warning rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory cannot be created.
    pub fn open(
        path: impl Into<PathBuf>,
        flush_interval: Duration,
        flush_bytes: u64,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let backup_path = backup_path_for(&path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let records = match load_document(&path) {
            Ok(records) => records,
            Err(primary_err) => {
                if path.exists() {
                    warn!(
                        path = %path.display(),
                        error = %primary_err,
                        "primary status document unusable, trying backup"
                    );
                }
                match load_document(&backup_path) {
                    Ok(records) => {
                        warn!(
                            backup = %backup_path.display(),
                            records = records.len(),
                            "recovered status from backup document"
                        );
                        records
                    }
                    Err(backup_err) => {
                        if backup_path.exists() {
                            warn!(
                                backup = %backup_path.display(),
                                error = %backup_err,
                                "backup status document also unusable, starting empty"
                            );
                        } else {
                            debug!(path = %path.display(), "no status document, starting empty");
                        }
                        BTreeMap::new()
                    }
                }
            }
        };

        Ok(Self {
            path,
            backup_path,
            records,
            flush_interval,
            flush_bytes,
            last_flush: Instant::now(),
            bytes_since_flush: 0,
        })
    }

    /// Returns the record for a task id, if one exists.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&ResumeRecord> {
        self.records.get(task_id)
    }

    /// Returns a point-in-time copy of the whole map.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ResumeRecord> {
        self.records.clone()
    }

    /// Returns the number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or replaces a record and flushes immediately.
    ///
    /// Used for state transitions, which must never sit only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the flush fails; the in-memory update is
    /// retained either way.
    pub fn upsert(&mut self, task_id: &str, mut record: ResumeRecord) -> Result<(), StoreError> {
        record.updated_at = Utc::now();
        self.records.insert(task_id.to_string(), record);
        self.flush()
    }

    /// Applies a mutation to an existing record and flushes immediately.
    ///
    /// Missing ids are created as fresh `Queued` records first, so the first
    /// sighting of a task id always produces a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the flush fails.
    pub fn update<F>(&mut self, task_id: &str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ResumeRecord),
    {
        let record = self
            .records
            .entry(task_id.to_string())
            .or_insert_with(ResumeRecord::queued);
        mutate(record);
        record.updated_at = Utc::now();
        self.flush()
    }

    /// Records byte progress with a debounced flush.
    ///
    /// The in-memory record is always updated; the document is rewritten only
    /// when the configured interval has elapsed or enough bytes accumulated
    /// since the last flush. Returns whether a flush happened.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a due flush fails.
    pub fn record_progress(
        &mut self,
        task_id: &str,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<bool, StoreError> {
        let record = self
            .records
            .entry(task_id.to_string())
            .or_insert_with(ResumeRecord::queued);
        let delta = bytes_downloaded.saturating_sub(record.bytes_downloaded);
        record.bytes_downloaded = bytes_downloaded;
        if total_bytes.is_some() {
            record.total_bytes = total_bytes;
        }
        record.updated_at = Utc::now();

        self.bytes_since_flush = self.bytes_since_flush.saturating_add(delta);
        let due = self.last_flush.elapsed() >= self.flush_interval
            || self.bytes_since_flush >= self.flush_bytes;
        if due {
            self.flush()?;
        }
        Ok(due)
    }

    /// Removes records whose task ids are not in the live set.
    ///
    /// Records are never deleted automatically; this is the explicit purge
    /// operation for entries no longer referenced by the current task set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the flush fails.
    pub fn purge(&mut self, live_ids: &[&str]) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|id, _| live_ids.contains(&id.as_str()));
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, "purged unreferenced status records");
            self.flush()?;
        }
        Ok(removed)
    }

    /// Writes the current map to disk using the backup-then-rename protocol.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or IO failure. The in-memory
    /// state is unaffected; callers may keep operating and retry later.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        // Preserve the prior generation before replacing the primary.
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| StoreError::io(&self.backup_path, e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let file = File::create(&temp_path).map_err(|e| StoreError::io(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.records)?;
        writer.flush().map_err(|e| StoreError::io(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        self.last_flush = Instant::now();
        self.bytes_since_flush = 0;
        debug!(
            path = %self.path.display(),
            records = self.records.len(),
            "status document flushed"
        );
        Ok(())
    }

    /// Counts records currently in the given status.
    #[must_use]
    pub fn count_with_status(&self, status: TransferStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }
}

/// Derives the backup path for a primary document (`status.json` →
/// `status.json.bak`).
fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "status.json".into(), std::ffi::OsStr::to_os_string);
    name.push(".bak");
    path.with_file_name(name)
}

/// Loads and parses a status document; errors cover both absence and
/// corruption so the caller can fall through the recovery chain.
fn load_document(path: &Path) -> Result<BTreeMap<String, ResumeRecord>, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open_store(dir: &TempDir) -> StatusStore {
        StatusStore::open(
            dir.path().join("status.json"),
            Duration::from_secs(2),
            1024 * 1024,
        )
        .unwrap()
    }

    #[test]
    fn test_open_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_upsert_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(&dir);
            let mut record = ResumeRecord::queued();
            record.bytes_downloaded = 42;
            store.upsert("task-1", record).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get("task-1").unwrap().bytes_downloaded, 42);
    }

    #[test]
    fn test_update_creates_record_on_first_sighting() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store
            .update("new-task", |r| r.status = TransferStatus::InProgress)
            .unwrap();
        assert_eq!(
            store.get("new-task").unwrap().status,
            TransferStatus::InProgress
        );
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.upsert("a", ResumeRecord::queued()).unwrap();
        let snap = store.snapshot();
        store
            .update("a", |r| r.status = TransferStatus::Completed)
            .unwrap();
        // Snapshot is unaffected by the later mutation.
        assert_eq!(snap.get("a").unwrap().status, TransferStatus::Queued);
    }

    #[test]
    fn test_flush_creates_backup_of_prior_generation() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("status.json");
        let mut store = open_store(&dir);

        let mut first = ResumeRecord::queued();
        first.bytes_downloaded = 1;
        store.upsert("t", first).unwrap();

        let mut second = ResumeRecord::queued();
        second.bytes_downloaded = 2;
        store.upsert("t", second).unwrap();

        // Backup holds generation 1, primary holds generation 2.
        let backup = primary.with_file_name("status.json.bak");
        let backup_map: BTreeMap<String, ResumeRecord> =
            serde_json::from_slice(&fs::read(&backup).unwrap()).unwrap();
        let primary_map: BTreeMap<String, ResumeRecord> =
            serde_json::from_slice(&fs::read(&primary).unwrap()).unwrap();
        assert_eq!(backup_map.get("t").unwrap().bytes_downloaded, 1);
        assert_eq!(primary_map.get("t").unwrap().bytes_downloaded, 2);
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("status.json");
        {
            let mut store = open_store(&dir);
            store.upsert("t", ResumeRecord::queued()).unwrap();
            // Second flush pushes a valid generation into the backup.
            store
                .update("t", |r| r.bytes_downloaded = 7)
                .unwrap();
        }
        fs::write(&primary, b"{ truncated garbage").unwrap();

        let store = open_store(&dir);
        // Backup is one generation behind the corrupted primary.
        assert_eq!(store.get("t").unwrap().bytes_downloaded, 0);
    }

    #[test]
    fn test_corrupt_primary_and_backup_cold_starts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("status.json"), b"not json").unwrap();
        fs::write(dir.path().join("status.json.bak"), b"also not json").unwrap();
        let store = open_store(&dir);
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_progress_debounces_by_time() {
        let dir = TempDir::new().unwrap();
        let mut store = StatusStore::open(
            dir.path().join("status.json"),
            Duration::from_secs(3600),
            u64::MAX,
        )
        .unwrap();
        store.upsert("t", ResumeRecord::queued()).unwrap();

        // Inside the debounce window: memory updated, no flush.
        let flushed = store.record_progress("t", 100, Some(1000)).unwrap();
        assert!(!flushed);
        assert_eq!(store.get("t").unwrap().bytes_downloaded, 100);
    }

    #[test]
    fn test_record_progress_flushes_on_byte_threshold() {
        let dir = TempDir::new().unwrap();
        let mut store = StatusStore::open(
            dir.path().join("status.json"),
            Duration::from_secs(3600),
            512,
        )
        .unwrap();
        store.upsert("t", ResumeRecord::queued()).unwrap();

        assert!(!store.record_progress("t", 100, None).unwrap());
        // Crossing the byte threshold forces a flush.
        assert!(store.record_progress("t", 700, None).unwrap());
    }

    #[test]
    fn test_purge_removes_unreferenced_records() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.upsert("keep", ResumeRecord::queued()).unwrap();
        store.upsert("drop", ResumeRecord::queued()).unwrap();

        let removed = store.purge(&["keep"]).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("keep").is_some());
        assert!(store.get("drop").is_none());
    }

    #[test]
    fn test_no_temp_file_left_after_flush() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.upsert("t", ResumeRecord::queued()).unwrap();
        assert!(!dir.path().join("status.json.tmp").exists());
    }

    #[test]
    fn test_count_with_status() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.upsert("a", ResumeRecord::queued()).unwrap();
        store
            .update("b", |r| r.status = TransferStatus::Completed)
            .unwrap();
        assert_eq!(store.count_with_status(TransferStatus::Queued), 1);
        assert_eq!(store.count_with_status(TransferStatus::Completed), 1);
        assert_eq!(store.count_with_status(TransferStatus::Failed), 0);
    }
}
