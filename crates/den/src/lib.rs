//! Den - Alopex Log Record Storage Engine
//!
//! This crate provides an embedded, append-mostly store for timestamped log
//! records. Records are partitioned into one file per calendar day, grouped
//! into one page per minute, and scanned back with time range and label
//! predicates.
//!
//! # Components
//!
//! - [`LogStore`]: Engine facade (durable buffer, memtable, storage)
//! - [`MemTable`]: Sorting in-memory buffer with a background flusher
//! - [`PageFileWriter`] / [`PageFileReader`]: Partition file I/O
//! - [`PartitionIndex`]: Day-keyed file index with read/write admission
//! - [`Storage`]: Write cursor and query evaluation
//! - [`PendingLog`] / [`MinuteLog`]: WAL flavors behind [`DurableBuffer`]
//! - [`Compactor`]: Per-day merging of partition files
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::{LabelQuery, LogRecord, LogStore, StoreConfig, TimeRange};
//!
//! let store = LogStore::open(StoreConfig::new("/var/lib/den"))?;
//!
//! store.append(
//!     LogRecord::new(1_704_067_200, 1)
//!         .with_label("service", "api")
//!         .with_label("status", 500i64)
//!         .with_message("upstream timeout"),
//! )?;
//! store.flush()?;
//!
//! let query = LabelQuery::new(TimeRange::all()).with_label("service", "api");
//! for record in store.query(&query)?.records {
//!     println!("{} {:?}", record.timestamp, record.message);
//! }
//! store.close()?;
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
pub mod lifecycle;
pub mod memtable;
pub mod page;
pub mod query;
pub mod storage;
pub mod wal;

pub use codec::{CompressionType, StreamCodec};
pub use config::{
    CompactionConfig, DurabilityConfig, MemTableConfig, MinuteLogConfig, PendingLogConfig,
    StoreConfig, SyncMode, WriterConfig,
};
pub use engine::{LogStore, RecordTransformer, StoreStats};
pub use error::{DenError, Result};
pub use format::{DayKey, FileHeader, Label, LabelValue, LogRecord, PageHeader, RecordMeta};
pub use index::{AccessState, IndexItem, PartitionIndex};
pub use lifecycle::{CompactionReport, Compactor, MergeStrategy};
pub use memtable::{FlushSink, MemTable};
pub use page::{PageFileReader, PageFileWriter};
pub use query::{LabelQuery, PreparedQuery, QueryReport, QueryResult, TimeRange};
pub use storage::Storage;
pub use wal::{DurableBuffer, MinuteLog, PendingLog};
