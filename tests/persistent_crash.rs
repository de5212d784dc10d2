//! Crash recovery tests for the durable alarm store.
//!
//! These tests verify that the store correctly handles:
//! - Partial writes (simulated crash mid-append)
//! - CRC corruption detection
//! - Foreign files in place of the log
//! - Resuming a monitor from flags written by an earlier process

#![cfg(feature = "persistent")]

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use petfence::storage::{open_alarm_store, AlarmStore, InMemoryStores};
use petfence::{
    AlarmState, AlertKind, Coordinate, EntityId, ExecutionError, FenceError, MonitorService,
    NotificationSink, RecordingSink, SafeZone, TrackerState,
};

fn id(name: &str) -> EntityId {
    EntityId::new(name).unwrap()
}

async fn write_flags(dir: &std::path::Path) {
    let store = open_alarm_store(dir, None).unwrap();
    store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
    store.put_alarm(&AlarmState::armed(id("fido"))).await.unwrap();
}

#[tokio::test]
async fn torn_final_record_is_discarded() {
    let dir = tempdir().unwrap();
    write_flags(dir.path()).await;

    let wal_path = dir.path().join("alarms.wal");
    let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    let size = file.metadata().unwrap().len();
    file.set_len(size - 3).unwrap();
    drop(file);

    let store = open_alarm_store(dir.path(), None).unwrap();
    assert!(store.corruption_detected());
    assert_eq!(store.list_armed().await.unwrap(), vec![id("rex")]);

    // The damaged tail is gone, so new writes survive the next reopen.
    store.put_alarm(&AlarmState::armed(id("bella"))).await.unwrap();
    drop(store);
    let store = open_alarm_store(dir.path(), None).unwrap();
    assert!(!store.corruption_detected());
    assert_eq!(store.list_armed().await.unwrap(), vec![id("bella"), id("rex")]);
}

#[tokio::test]
async fn checksum_mismatch_cuts_log_at_bad_record() {
    let dir = tempdir().unwrap();
    write_flags(dir.path()).await;

    // Flip a byte inside the last record's payload.
    let wal_path = dir.path().join("alarms.wal");
    let mut file = fs::OpenOptions::new().read(true).write(true).open(&wal_path).unwrap();
    let size = file.metadata().unwrap().len();
    file.seek(SeekFrom::Start(size - 8)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(size - 8)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    drop(file);

    let store = open_alarm_store(dir.path(), None).unwrap();
    assert!(store.corruption_detected());
    assert!(store.is_armed(&id("rex")).await.unwrap());
    assert!(!store.is_armed(&id("fido")).await.unwrap());
}

#[tokio::test]
async fn foreign_file_is_refused() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("alarms.wal"), b"not an alarm log at all").unwrap();

    let err = open_alarm_store(dir.path(), None).unwrap_err();
    assert!(
        matches!(err, FenceError::Execution(ExecutionError::Storage { ref message }) if message.contains("Corrupted")),
        "got {err:?}"
    );
}

#[tokio::test]
async fn reopen_is_idempotent() {
    let dir = tempdir().unwrap();
    write_flags(dir.path()).await;

    for _ in 0..3 {
        let store = open_alarm_store(dir.path(), None).unwrap();
        assert!(!store.corruption_detected());
        assert_eq!(store.list_armed().await.unwrap(), vec![id("fido"), id("rex")]);
    }
}

#[tokio::test(start_paused = true)]
async fn monitor_resumes_from_durable_flag() {
    let dir = tempdir().unwrap();
    {
        let store = open_alarm_store(dir.path(), None).unwrap();
        store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
    }

    let stores = InMemoryStores::default();
    stores
        .zones
        .insert(SafeZone::new(id("rex"), Coordinate::new(0.0, 0.0), 100.0).unwrap())
        .unwrap();
    let sink = Arc::new(RecordingSink::new());
    let service = MonitorService::builder()
        .in_memory(&stores)
        .alarm_store(Arc::new(open_alarm_store(dir.path(), None).unwrap()))
        .notifier(Arc::clone(&sink) as Arc<dyn NotificationSink>)
        .build()
        .unwrap();

    service.start_monitoring(&id("rex")).await.unwrap();
    assert_eq!(service.tracker_state(&id("rex")), Some(TrackerState::Outside));
    let captured = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    service.report_position(&id("rex"), 0.0, 0.01, captured).unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(sink.count(AlertKind::Exit), 0);
    assert_eq!(sink.count(AlertKind::Reminder), 1);
}
