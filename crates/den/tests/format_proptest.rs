//! Property-based tests for the record format and memtable ordering.
//!
//! Uses proptest to verify lossless record encoding and that every memtable
//! chunk reaches its sink in timestamp order, whatever the insertion order.

use alopex_den::format::{FileHeader, PageHeader, RecordMeta};
use alopex_den::memtable::{FlushOutcome, FlushSink, FrozenBuffer};
use alopex_den::{DayKey, Label, LabelValue, LogRecord, MemTable, MemTableConfig, Result};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// 2024-01-01 00:00:00 UTC
const DAY_START: i64 = 1_704_067_200;

fn label_value_strategy() -> impl Strategy<Value = LabelValue> {
    prop_oneof![
        "[a-zA-Z0-9 _./-]{0,24}".prop_map(LabelValue::String),
        any::<i64>().prop_map(LabelValue::Int),
        // NaN never compares equal, keep to finite values
        prop::num::f64::NORMAL.prop_map(LabelValue::Float),
    ]
}

fn record_strategy() -> impl Strategy<Value = LogRecord> {
    (
        -1_000_000_000_000i64..4_000_000_000_000i64,
        any::<u16>(),
        prop::collection::vec(("[a-z_]{1,16}", label_value_strategy()), 0..8),
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(timestamp, schema_version, labels, message)| LogRecord {
            timestamp,
            schema_version,
            labels: labels
                .into_iter()
                .map(|(key, value)| Label { key, value })
                .collect(),
            message,
        })
}

/// Sink recording the timestamps of every chunk it receives.
#[derive(Default)]
struct OrderSink {
    chunks: Mutex<Vec<Vec<i64>>>,
}

impl FlushSink for OrderSink {
    fn flush_chunk(&self, chunk: &mut FrozenBuffer) -> Result<FlushOutcome> {
        let mut timestamps = Vec::with_capacity(chunk.len());
        while let Some(entry) = chunk.pop() {
            timestamps.push(entry.record.timestamp);
        }
        let written = timestamps.len();
        self.chunks.lock().push(timestamps);
        Ok(FlushOutcome {
            written,
            rejected: 0,
        })
    }
}

proptest! {
    /// Encoding then decoding a record is lossless.
    #[test]
    fn test_record_roundtrip_proptest(record in record_strategy()) {
        let bytes = record.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), record.encoded_len());

        let decoded = LogRecord::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &record);

        let streamed = LogRecord::read_from(&mut bytes.as_slice()).unwrap();
        prop_assert_eq!(&streamed, &record);
    }

    /// Record metadata survives its fixed-size encoding.
    #[test]
    fn test_record_meta_roundtrip_proptest(record in record_strategy()) {
        let meta = record.meta().unwrap();
        let decoded = RecordMeta::from_bytes(&meta.to_bytes()).unwrap();
        prop_assert_eq!(decoded, meta);
    }

    /// File headers keep their page range, id and count.
    #[test]
    fn test_file_header_roundtrip_proptest(
        days in 0i64..40_000,
        file_id in any::<u64>(),
        pages in prop::collection::btree_set(0u16..1440, 0..20),
        record_count in any::<u64>(),
    ) {
        let day = DayKey::from_timestamp(days * 86_400).unwrap();
        let mut header = FileHeader::new(day, file_id);
        for page in &pages {
            header.note_page(*page);
        }
        header.record_count = record_count;

        let decoded = FileHeader::from_bytes(&header.to_bytes()).unwrap();
        prop_assert_eq!(decoded.page_range(), pages.first().copied().zip(pages.last().copied()));
        prop_assert_eq!(decoded, header);
    }

    /// Page headers keep their counters.
    #[test]
    fn test_page_header_roundtrip_proptest(
        page in 0u16..1440,
        size in any::<u32>(),
        record_count in any::<u32>(),
        raw_size in any::<u32>(),
    ) {
        let mut header = PageHeader::new(page);
        header.byte_size = size;
        header.record_count = record_count;
        header.raw_size = raw_size;
        let decoded = PageHeader::from_bytes(&header.to_bytes()).unwrap();
        prop_assert_eq!(decoded, header);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every chunk is emitted in non-decreasing timestamp order.
    #[test]
    fn test_memtable_chunks_sorted_proptest(
        offsets in prop::collection::vec(0i64..86_400, 1..400),
        max_records in 1usize..64,
    ) {
        let sink = Arc::new(OrderSink::default());
        let config = MemTableConfig::default()
            .with_max_records(max_records)
            .with_idle_flush_interval(Duration::from_secs(3600));
        let memtable = MemTable::new(config, Arc::clone(&sink) as Arc<dyn FlushSink>).unwrap();

        for (seq, offset) in offsets.iter().enumerate() {
            memtable
                .add(seq as u64 + 1, LogRecord::new(DAY_START + offset, 1))
                .unwrap();
        }
        memtable.flush_and_wait().unwrap();
        memtable.close().unwrap();

        let chunks = sink.chunks.lock();
        let total: usize = chunks.iter().map(Vec::len).sum();
        prop_assert_eq!(total, offsets.len());
        for chunk in chunks.iter() {
            prop_assert!(chunk.len() <= max_records);
            prop_assert!(chunk.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
