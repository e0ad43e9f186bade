//! Integration tests for both durable buffer flavors.

use alopex_den::wal::{
    ensure_clean, list_wal_files, open_buffer, read_minute_wal_file, read_wal_file,
};
use alopex_den::{
    DurabilityConfig, LogRecord, MinuteLogConfig, PendingLogConfig, SyncMode,
};
use std::fs;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// 2024-01-01 00:00:00 UTC
const DAY_START: i64 = 1_704_067_200;

fn record(ts: i64) -> LogRecord {
    LogRecord::new(ts, 1)
        .with_label("host", "server1")
        .with_message(format!("event at {ts}"))
}

fn no_dirty_files(dir: &std::path::Path) -> bool {
    fs::read_dir(dir)
        .unwrap()
        .all(|entry| !entry.unwrap().path().to_string_lossy().ends_with(".dirty"))
}

#[test]
fn test_pending_log_flushes_on_record_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let config = DurabilityConfig::PendingLog(
        PendingLogConfig::default()
            .with_max_records(4)
            .with_flush_interval(Duration::from_secs(3600))
            .with_sync_mode(SyncMode::Fsync),
    );
    let mut buffer = open_buffer(temp_dir.path(), &config).unwrap().unwrap();

    for seq in 1..=10 {
        buffer.append(seq, &record(DAY_START + seq as i64)).unwrap();
    }
    assert_eq!(buffer.live_files(), 2);
    assert_eq!(buffer.pending(), 2);
    assert!(no_dirty_files(temp_dir.path()));

    // Interval not elapsed and below threshold: tick is a no-op.
    buffer.tick().unwrap();
    assert_eq!(buffer.pending(), 2);

    let files = list_wal_files(temp_dir.path()).unwrap();
    assert_eq!(files.len(), 2);
    let first = read_wal_file(&files[0]).unwrap();
    assert_eq!(first.header.record_count, 4);
    assert_eq!(first.header.first_seq, 1);
    assert_eq!(first.header.last_seq, 4);
    let seqs: Vec<u64> = first.entries.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(first.entries[0].1, record(DAY_START + 1));

    buffer.flush(true).unwrap();
    assert_eq!(buffer.pending(), 0);
    assert_eq!(buffer.live_files(), 3);

    assert_eq!(buffer.release(4).unwrap(), 1);
    assert_eq!(buffer.release(9).unwrap(), 1);
    assert_eq!(buffer.release(10).unwrap(), 1);
    assert!(list_wal_files(temp_dir.path()).unwrap().is_empty());
}

#[test]
fn test_pending_log_flushes_on_interval() {
    let temp_dir = TempDir::new().unwrap();
    let config = DurabilityConfig::PendingLog(
        PendingLogConfig::default()
            .with_flush_interval(Duration::from_millis(20))
            .with_sync_mode(SyncMode::None),
    );
    let mut buffer = open_buffer(temp_dir.path(), &config).unwrap().unwrap();

    buffer.append(1, &record(DAY_START)).unwrap();
    thread::sleep(Duration::from_millis(40));
    buffer.tick().unwrap();
    assert_eq!(buffer.pending(), 0);
    assert_eq!(list_wal_files(temp_dir.path()).unwrap().len(), 1);
}

#[test]
fn test_minute_log_drains_only_cooled_minutes() {
    let temp_dir = TempDir::new().unwrap();
    let config = DurabilityConfig::MinuteLog(
        MinuteLogConfig::default()
            .with_ttl(Duration::from_millis(100))
            .with_sync_mode(SyncMode::None),
    );
    let mut buffer = open_buffer(temp_dir.path(), &config).unwrap().unwrap();

    buffer.append(1, &record(DAY_START + 30)).unwrap();
    buffer.append(2, &record(DAY_START + 10)).unwrap();
    thread::sleep(Duration::from_millis(150));
    buffer.append(3, &record(DAY_START + 120)).unwrap();

    buffer.tick().unwrap();
    assert_eq!(buffer.pending(), 1);
    let files = list_wal_files(temp_dir.path()).unwrap();
    assert_eq!(files.len(), 1);

    let records = read_minute_wal_file(&files[0]).unwrap();
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, vec![DAY_START + 10, DAY_START + 30]);

    buffer.flush(true).unwrap();
    assert_eq!(buffer.pending(), 0);
    assert_eq!(buffer.live_files(), 2);

    // The first file holds seqs 1 and 2, the second seq 3.
    assert_eq!(buffer.release(2).unwrap(), 1);
    assert_eq!(buffer.live_files(), 1);
    assert_eq!(buffer.release(3).unwrap(), 1);
    assert!(no_dirty_files(temp_dir.path()));
}

#[test]
fn test_minute_log_writes_one_file_per_day() {
    let temp_dir = TempDir::new().unwrap();
    let config = DurabilityConfig::MinuteLog(
        MinuteLogConfig::default().with_sync_mode(SyncMode::None),
    );
    let mut buffer = open_buffer(temp_dir.path(), &config).unwrap().unwrap();

    buffer.append(1, &record(DAY_START - 60)).unwrap();
    buffer.append(2, &record(DAY_START)).unwrap();
    buffer.append(3, &record(DAY_START + 61)).unwrap();
    buffer.flush(true).unwrap();

    let files = list_wal_files(temp_dir.path()).unwrap();
    assert_eq!(files.len(), 2);
    let counts: Vec<usize> = files
        .iter()
        .map(|path| read_minute_wal_file(path).unwrap().len())
        .collect();
    assert_eq!(counts, vec![1, 2]);
}

#[test]
fn test_disabled_durability_builds_no_buffer() {
    let temp_dir = TempDir::new().unwrap();
    assert!(open_buffer(temp_dir.path(), &DurabilityConfig::None)
        .unwrap()
        .is_none());
}

#[test]
fn test_ensure_clean_rejects_dirty_and_keeps_complete_files() {
    let temp_dir = TempDir::new().unwrap();
    let wal_dir = temp_dir.path().join("wal");
    ensure_clean(&wal_dir).unwrap();
    assert!(wal_dir.is_dir());

    fs::write(wal_dir.join("00000000000000000001.wal"), b"complete").unwrap();
    ensure_clean(&wal_dir).unwrap();

    fs::write(wal_dir.join("00000000000000000002.wal.dirty"), b"partial").unwrap();
    assert!(ensure_clean(&wal_dir).is_err());
}
