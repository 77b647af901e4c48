//! Crash-safety and recovery scenarios for the persisted status document.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;

use coursegrab_core::{ResumeRecord, StatusStore, TransferStatus};

fn open(dir: &TempDir) -> StatusStore {
    StatusStore::open(
        dir.path().join("status.json"),
        Duration::from_secs(2),
        1024 * 1024,
    )
    .unwrap()
}

#[test]
fn state_survives_abrupt_process_exit() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(&dir);
        store
            .update("lesson-1", |r| {
                r.status = TransferStatus::InProgress;
                r.bytes_downloaded = 4096;
                r.total_bytes = Some(10_000);
                r.attempt_count = 1;
            })
            .unwrap();
        // Dropped without any explicit close, as a crash would leave it.
    }

    let store = open(&dir);
    let record = store.get("lesson-1").unwrap();
    assert_eq!(record.status, TransferStatus::InProgress);
    assert_eq!(record.bytes_downloaded, 4096);
    assert_eq!(record.attempt_count, 1);
}

#[test]
fn torn_primary_write_falls_back_to_backup() {
    let dir = TempDir::new().unwrap();
    let primary = dir.path().join("status.json");
    {
        let mut store = open(&dir);
        store
            .update("t", |r| r.bytes_downloaded = 100)
            .unwrap();
        store
            .update("t", |r| r.bytes_downloaded = 200)
            .unwrap();
    }

    // Simulate a crash mid-rename leaving a truncated primary.
    let full = std::fs::read(&primary).unwrap();
    std::fs::write(&primary, &full[..full.len() / 2]).unwrap();

    let store = open(&dir);
    // The backup is one flush generation behind; no record is lost entirely.
    assert_eq!(store.get("t").unwrap().bytes_downloaded, 100);
}

#[test]
fn both_documents_corrupt_is_a_cold_start() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("status.json"), b"\x00\x01garbage").unwrap();
    std::fs::write(dir.path().join("status.json.bak"), b"more garbage").unwrap();

    let store = open(&dir);
    assert!(store.is_empty());
}

#[test]
fn flush_replaces_never_edits_in_place() {
    let dir = TempDir::new().unwrap();
    let primary = dir.path().join("status.json");
    let mut store = open(&dir);

    store.upsert("a", ResumeRecord::queued()).unwrap();
    // Every generation on disk must parse as a complete document.
    let first: BTreeMap<String, ResumeRecord> =
        serde_json::from_slice(&std::fs::read(&primary).unwrap()).unwrap();
    assert!(first.contains_key("a"));

    store.upsert("b", ResumeRecord::queued()).unwrap();
    let second: BTreeMap<String, ResumeRecord> =
        serde_json::from_slice(&std::fs::read(&primary).unwrap()).unwrap();
    assert_eq!(second.len(), 2);

    // No stray temporary file after any flush.
    assert!(!dir.path().join("status.json.tmp").exists());
}

#[test]
fn terminal_transitions_are_durable_immediately() {
    let dir = TempDir::new().unwrap();
    let primary = dir.path().join("status.json");
    let mut store = open(&dir);

    store
        .update("t", |r| {
            r.status = TransferStatus::Completed;
            r.bytes_downloaded = 123;
            r.checksum = Some("ab".repeat(32));
        })
        .unwrap();

    // Visible on disk without waiting for any debounce window.
    let on_disk: BTreeMap<String, ResumeRecord> =
        serde_json::from_slice(&std::fs::read(&primary).unwrap()).unwrap();
    assert_eq!(on_disk.get("t").unwrap().status, TransferStatus::Completed);
    assert_eq!(on_disk.get("t").unwrap().checksum.as_deref(), Some("ab".repeat(32).as_str()));
}

#[test]
fn debounced_progress_is_bounded_loss() {
    let dir = TempDir::new().unwrap();
    let primary = dir.path().join("status.json");
    let mut store = StatusStore::open(&primary, Duration::from_secs(3600), 1000).unwrap();

    store.upsert("t", ResumeRecord::queued()).unwrap();
    // Small increments stay in memory until the byte threshold.
    assert!(!store.record_progress("t", 200, Some(5000)).unwrap());
    assert!(!store.record_progress("t", 600, Some(5000)).unwrap());
    // Crossing the threshold flushes; a crash now loses at most one window.
    assert!(store.record_progress("t", 1200, Some(5000)).unwrap());

    let on_disk: BTreeMap<String, ResumeRecord> =
        serde_json::from_slice(&std::fs::read(&primary).unwrap()).unwrap();
    assert_eq!(on_disk.get("t").unwrap().bytes_downloaded, 1200);
}

#[test]
fn document_is_ordered_by_task_id() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    store.upsert("zeta", ResumeRecord::queued()).unwrap();
    store.upsert("alpha", ResumeRecord::queued()).unwrap();
    store.upsert("mid", ResumeRecord::queued()).unwrap();

    let text = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
    let alpha = text.find("alpha").unwrap();
    let mid = text.find("mid").unwrap();
    let zeta = text.find("zeta").unwrap();
    assert!(alpha < mid && mid < zeta, "document keys should be sorted");
}
