//! Integration tests for the complete write path.
//!
//! These tests drive the public API end to end:
//! - LogStore → MemTable → Storage → partition files
//! - Storage write cursor ordering
//! - Startup checks on the WAL directory

use alopex_den::page::PageFileReader;
use alopex_den::{
    DayKey, DenError, LabelQuery, LogRecord, LogStore, MemTableConfig, PreparedQuery, Storage,
    StoreConfig, SyncMode, TimeRange, WriterConfig,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

// 2024-01-01 00:00:00 UTC
const DAY_START: i64 = 1_704_067_200;

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path())
        .with_writer(WriterConfig::default().with_sync_mode(SyncMode::None))
        .with_memtable(MemTableConfig::default().with_max_records(500))
}

fn minute_record(minute: i64) -> LogRecord {
    LogRecord::new(DAY_START + minute * 60, 1)
        .with_label("service", if minute % 2 == 0 { "api" } else { "worker" })
        .with_label("minute", minute)
        .with_message(format!("minute {minute}"))
}

/// Query counting hits and misses through the callbacks.
struct CountingQuery {
    inner: LabelQuery,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl PreparedQuery for CountingQuery {
    fn time_range(&self) -> TimeRange {
        self.inner.time_range()
    }

    fn matches(&self, record: &LogRecord) -> bool {
        self.inner.matches(record)
    }

    fn on_hit(&self, _record: &LogRecord) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_miss(&self, _record: &LogRecord) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// One record per minute of a day ends up in one file covering every page.
#[test]
fn test_full_day_single_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = store_config(&temp_dir);
    let data_dir = config.data_dir.clone();

    let store = LogStore::open(config).unwrap();
    for minute in 0..1440 {
        store.append(minute_record(minute)).unwrap();
    }
    store.flush().unwrap();

    let files: Vec<_> = fs::read_dir(&data_dir).unwrap().collect();
    assert_eq!(files.len(), 1);
    let path = files[0].as_ref().unwrap().path();
    assert!(path.ends_with("2024-01-01.1.den"));

    let day = DayKey::from_timestamp(DAY_START).unwrap();
    let query = CountingQuery {
        inner: LabelQuery::new(TimeRange::new(day.start_timestamp(), day.end_timestamp())),
        hits: AtomicUsize::new(0),
        misses: AtomicUsize::new(0),
    };
    let result = store.query(&query).unwrap();
    assert_eq!(result.records.len(), 1440);
    assert_eq!(result.report.hits, 1440);
    assert_eq!(result.report.misses, 0);
    assert_eq!(query.hits.load(Ordering::Relaxed), 1440);
    assert_eq!(query.misses.load(Ordering::Relaxed), 0);
    store.close().unwrap();

    let mut reader = PageFileReader::open(&path).unwrap();
    let header = reader.header().unwrap().clone();
    assert_eq!(header.first_page, Some(0));
    assert_eq!(header.last_page, Some(1439));
    assert_eq!(header.record_count, 1440);
    assert_eq!(reader.read_all().unwrap().len(), 1440);
}

/// Label predicates split the day between services.
#[test]
fn test_label_query_filters() {
    let temp_dir = TempDir::new().unwrap();
    let store = LogStore::open(store_config(&temp_dir)).unwrap();
    for minute in 0..120 {
        store.append(minute_record(minute)).unwrap();
    }
    store.flush().unwrap();

    let api = store
        .query(&LabelQuery::new(TimeRange::all()).with_label("service", "api"))
        .unwrap();
    assert_eq!(api.records.len(), 60);
    assert_eq!(api.report.misses, 60);

    let window = store
        .query(
            &LabelQuery::new(TimeRange::new(DAY_START + 600, DAY_START + 1199))
                .with_label("service", "worker"),
        )
        .unwrap();
    assert_eq!(window.records.len(), 5);
    assert!(window.report.pages_skipped > 0);

    let limited = store
        .query(&LabelQuery::new(TimeRange::all()).with_limit(10))
        .unwrap();
    assert_eq!(limited.records.len(), 10);
    assert!(limited.report.truncated);
}

/// A record from the previous day arriving after the cursor moved on.
#[test]
fn test_past_write_across_days() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Storage::open(&store_config(&temp_dir)).unwrap();

    // 2024-01-01 00:00:00, then 2023-12-31 23:59:00
    storage
        .store_log_record(&LogRecord::new(DAY_START, 1))
        .unwrap();
    let err = storage
        .store_log_record(&LogRecord::new(DAY_START - 60, 1))
        .unwrap_err();
    assert!(matches!(err, DenError::PastWrite { .. }), "{err}");
}

/// Out-of-order appends inside one memtable chunk are sorted before writing.
#[test]
fn test_memtable_sorts_within_chunk() {
    let temp_dir = TempDir::new().unwrap();
    let store = LogStore::open(store_config(&temp_dir)).unwrap();
    for minute in (0..50).rev() {
        store.append(minute_record(minute)).unwrap();
    }
    store.flush().unwrap();

    let stats = store.stats();
    assert_eq!(stats.records_written, 50);
    assert_eq!(stats.records_rejected, 0);

    let result = store.query(&LabelQuery::new(TimeRange::all())).unwrap();
    let timestamps: Vec<i64> = result.records.iter().map(|r| r.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);
}

/// Records behind an already flushed chunk are rejected, not lost.
#[test]
fn test_late_records_rejected_after_flush() {
    let temp_dir = TempDir::new().unwrap();
    let store = LogStore::open(store_config(&temp_dir)).unwrap();
    store.append(minute_record(10)).unwrap();
    store.flush().unwrap();
    store.append(minute_record(5)).unwrap();
    store.flush().unwrap();

    let stats = store.stats();
    assert_eq!(stats.records_written, 1);
    assert_eq!(stats.records_rejected, 1);
    assert_eq!(stats.records_lost, 0);
    assert_eq!(stats.safe_seq, Some(2));
}

/// Concurrent appenders get unique sequence numbers.
#[test]
fn test_concurrent_appends() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(store_config(&temp_dir)).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..250)
                    .map(|i| {
                        let record = LogRecord::new(DAY_START + 3600, 1)
                            .with_label("worker", worker as i64)
                            .with_message(format!("{i}"));
                        store.append(record).unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seqs: Vec<u64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 1000);

    store.flush().unwrap();
    let result = store.query(&LabelQuery::new(TimeRange::all())).unwrap();
    assert_eq!(result.records.len(), 1000);
}

/// Reopening continues the newest file of the day.
#[test]
fn test_reopen_continues_day() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = LogStore::open(store_config(&temp_dir)).unwrap();
        for minute in 0..10 {
            store.append(minute_record(minute)).unwrap();
        }
        store.close().unwrap();
    }

    let store = LogStore::open(store_config(&temp_dir)).unwrap();
    for minute in 10..20 {
        store.append(minute_record(minute)).unwrap();
    }
    store.flush().unwrap();

    assert_eq!(store.stats().data_files, 1);
    let result = store.query(&LabelQuery::new(TimeRange::all())).unwrap();
    assert_eq!(result.records.len(), 20);
}

/// An interrupted WAL flush keeps the store from opening.
#[test]
fn test_dirty_wal_blocks_open() {
    let temp_dir = TempDir::new().unwrap();
    let config = store_config(&temp_dir);
    fs::create_dir_all(&config.wal_dir).unwrap();
    let dirty = config.wal_dir.join("00000000000000000042.wal.dirty");
    fs::write(&dirty, b"partial").unwrap();

    match LogStore::open(config) {
        Err(DenError::DirtyWal(path)) => assert_eq!(path, dirty),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("store opened over a dirty WAL"),
    }
}
