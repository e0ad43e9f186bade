//! Integration tests for file merging and day compaction.

use alopex_den::lifecycle::{merge_data_files, MergeStrategy};
use alopex_den::page::{DataFileInfo, PageFileReader, PageFileWriter};
use alopex_den::{
    CompactionConfig, CompressionType, DayKey, LabelQuery, LogRecord, LogStore, MemTableConfig,
    StoreConfig, SyncMode, TimeRange, WriterConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// 2024-01-01 00:00:00 UTC
const DAY_START: i64 = 1_704_067_200;

fn writer_config() -> WriterConfig {
    WriterConfig::default().with_sync_mode(SyncMode::None)
}

fn day() -> DayKey {
    DayKey::from_timestamp(DAY_START).unwrap()
}

/// Writes a file holding `(minute, second)` records, one page per minute.
fn write_file(dir: &Path, file_id: u64, records: &[(u16, i64)]) -> PathBuf {
    let path = DataFileInfo::path_in(dir, day(), file_id);
    let mut writer = PageFileWriter::create(&path, day(), file_id, writer_config()).unwrap();
    for &(minute, second) in records {
        if writer.current_page() != Some(minute) {
            writer.append_page(minute).unwrap();
        }
        let ts = day().page_start_timestamp(minute) + second;
        writer
            .append_record(
                &LogRecord::new(ts, 1)
                    .with_label("file", file_id as i64)
                    .with_message(format!("{minute}:{second}")),
            )
            .unwrap();
    }
    writer.close().unwrap();
    path
}

fn timestamps(path: &Path) -> Vec<i64> {
    PageFileReader::open(path)
        .unwrap()
        .read_all()
        .unwrap()
        .iter()
        .map(|record| record.timestamp)
        .collect()
}

fn check_merge(first: &[(u16, i64)], second: &[(u16, i64)], expected: MergeStrategy) {
    let dir = TempDir::new().unwrap();
    let a = write_file(dir.path(), 1, first);
    let b = write_file(dir.path(), 2, second);
    let out = DataFileInfo::path_in(dir.path(), day(), 3);

    let summary = merge_data_files(&a, &b, &out, 3, &writer_config()).unwrap();
    assert_eq!(summary.strategy, expected);
    assert_eq!(
        summary.header.record_count as usize,
        first.len() + second.len()
    );

    let mut expected_ts: Vec<i64> = first
        .iter()
        .chain(second)
        .map(|&(minute, second)| day().page_start_timestamp(minute) + second)
        .collect();
    expected_ts.sort_unstable();
    assert_eq!(timestamps(&out), expected_ts);
}

#[test]
fn test_merge_append_preserves_records() {
    check_merge(
        &[(0, 1), (0, 2), (3, 0)],
        &[(4, 0), (9, 30)],
        MergeStrategy::Append,
    );
}

#[test]
fn test_merge_boundary_preserves_records() {
    check_merge(
        &[(0, 1), (5, 10), (5, 40)],
        &[(5, 20), (5, 50), (6, 0)],
        MergeStrategy::BoundaryMerge,
    );
}

#[test]
fn test_merge_interleaved_preserves_records() {
    check_merge(
        &[(1, 0), (3, 5), (7, 0), (9, 0)],
        &[(2, 0), (3, 1), (3, 59), (8, 0), (9, 0)],
        MergeStrategy::Interleaved,
    );
}

#[test]
fn test_merge_order_independent() {
    let dir = TempDir::new().unwrap();
    let a = write_file(dir.path(), 1, &[(10, 0), (11, 0)]);
    let b = write_file(dir.path(), 2, &[(0, 0), (1, 0)]);
    let out = DataFileInfo::path_in(dir.path(), day(), 3);

    let summary = merge_data_files(&a, &b, &out, 3, &writer_config()).unwrap();
    assert_eq!(summary.strategy, MergeStrategy::Append);
    assert_eq!(summary.header.first_page, Some(0));
    assert_eq!(summary.header.last_page, Some(11));
}

/// Sealed compressed pages force a new file per flush; compaction folds them.
#[test]
fn test_compaction_leaves_one_file_per_day() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::new(temp_dir.path())
        .with_writer(
            writer_config().with_compression(CompressionType::Gzip),
        )
        .with_memtable(MemTableConfig::default().with_max_records(5))
        .with_compaction(
            CompactionConfig::default()
                .with_max_files_per_day(1)
                .with_compression(CompressionType::Zstd)
                .with_sync_mode(SyncMode::None),
        );
    let data_dir = config.data_dir.clone();
    let store = LogStore::open(config).unwrap();

    // Same minute on two days; every chunk after the first reopens a sealed page.
    for i in 0..12 {
        store
            .append(LogRecord::new(DAY_START + 120 + i, 1).with_message(format!("a{i}")))
            .unwrap();
    }
    for i in 0..6 {
        store
            .append(LogRecord::new(DAY_START + 86_400 + i, 1).with_message(format!("b{i}")))
            .unwrap();
    }
    store.flush().unwrap();
    assert!(store.stats().data_files >= 4, "{:?}", store.stats());

    let reports = store.compact_all().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .flat_map(|report| &report.strategies)
        .all(|strategy| *strategy == MergeStrategy::BoundaryMerge));

    let mut per_day = std::collections::BTreeMap::new();
    for entry in fs::read_dir(&data_dir).unwrap() {
        let path = entry.unwrap().path();
        let info = DataFileInfo::from_path(&path).unwrap();
        *per_day.entry(info.day).or_insert(0) += 1;
    }
    assert_eq!(per_day.len(), 2);
    assert!(per_day.values().all(|&count| count == 1));

    let result = store.query(&LabelQuery::new(TimeRange::all())).unwrap();
    assert_eq!(result.records.len(), 18);
    assert!(result.report.errors.is_empty());
    store.close().unwrap();
}
