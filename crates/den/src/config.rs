//! Configuration for the Den storage engine.
//!
//! Every component takes a plain configuration struct with sensible
//! defaults and `with_*` builders; [`StoreConfig`] bundles them for
//! [`LogStore::open`](crate::engine::LogStore::open).

use crate::codec::{codec_for, CompressionType};
use crate::error::Result;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default page writer buffer threshold before an automatic flush (256 KB).
pub const DEFAULT_BUFFER_THRESHOLD: usize = 256 * 1024;

/// Default memtable byte threshold (32 MB).
pub const DEFAULT_MEMTABLE_MAX_BYTES: usize = 32 * 1024 * 1024;

/// Default memtable record threshold.
pub const DEFAULT_MEMTABLE_MAX_RECORDS: usize = 100_000;

/// Default idle interval after which a non-empty memtable is rotated.
pub const DEFAULT_IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default pending-log byte threshold (8 MB).
pub const DEFAULT_PENDING_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Default pending-log record threshold.
pub const DEFAULT_PENDING_MAX_RECORDS: usize = 10_000;

/// Default pending-log flush interval.
pub const DEFAULT_PENDING_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default time-to-live of a minute holder before it is considered cooled.
pub const DEFAULT_MINUTE_TTL: Duration = Duration::from_secs(90);

/// Default background tick interval for durable buffers.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of files a day may hold before compaction merges them.
pub const DEFAULT_MAX_FILES_PER_DAY: usize = 1;

/// Sync mode for file durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync data and metadata (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    /// Syncs `file` according to the mode.
    pub fn apply(self, file: &File) -> io::Result<()> {
        match self {
            Self::Fsync => file.sync_all(),
            Self::Fdatasync => file.sync_data(),
            Self::None => Ok(()),
        }
    }

    /// Syncs a directory entry according to the mode.
    pub fn sync_dir(self, dir: &Path) -> io::Result<()> {
        if self == Self::None {
            return Ok(());
        }
        File::open(dir)?.sync_all()
    }
}

/// Configuration for page file writers.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Staging buffer size that triggers a write to disk.
    pub buffer_threshold: usize,
    /// Sync mode applied on `sync` and `close`.
    pub sync_mode: SyncMode,
    /// Compression applied to each page when it is sealed.
    pub compression: CompressionType,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            sync_mode: SyncMode::default(),
            compression: CompressionType::None,
        }
    }
}

impl WriterConfig {
    /// Sets the staging buffer threshold.
    pub fn with_buffer_threshold(mut self, threshold: usize) -> Self {
        self.buffer_threshold = threshold;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the page compression.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Checks that pages can be written with this configuration.
    ///
    /// # Errors
    ///
    /// Returns `DenError::UnsupportedCompression` if no codec is built in for
    /// the configured compression.
    pub fn validate(&self) -> Result<()> {
        codec_for(self.compression)?;
        Ok(())
    }
}

/// Configuration for the memtable.
#[derive(Debug, Clone)]
pub struct MemTableConfig {
    /// Buffered bytes that make the active buffer full.
    pub max_bytes: usize,
    /// Buffered records that make the active buffer full.
    pub max_records: usize,
    /// How long a non-empty buffer may stay open before it is rotated.
    pub idle_flush_interval: Duration,
}

impl Default for MemTableConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MEMTABLE_MAX_BYTES,
            max_records: DEFAULT_MEMTABLE_MAX_RECORDS,
            idle_flush_interval: DEFAULT_IDLE_FLUSH_INTERVAL,
        }
    }
}

impl MemTableConfig {
    /// Sets the byte threshold.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the record threshold.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets the idle rotation interval.
    pub fn with_idle_flush_interval(mut self, interval: Duration) -> Self {
        self.idle_flush_interval = interval;
        self
    }
}

/// Configuration for the pending-list WAL.
#[derive(Debug, Clone)]
pub struct PendingLogConfig {
    /// Pending bytes that trigger a flush.
    pub max_bytes: usize,
    /// Pending records that trigger a flush.
    pub max_records: usize,
    /// Age of the oldest pending record that triggers a flush on tick.
    pub flush_interval: Duration,
    /// Sync mode for WAL files.
    pub sync_mode: SyncMode,
}

impl Default for PendingLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_PENDING_MAX_BYTES,
            max_records: DEFAULT_PENDING_MAX_RECORDS,
            flush_interval: DEFAULT_PENDING_FLUSH_INTERVAL,
            sync_mode: SyncMode::default(),
        }
    }
}

impl PendingLogConfig {
    /// Sets the byte threshold.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the record threshold.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets the time threshold.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Configuration for the per-minute WAL.
#[derive(Debug, Clone)]
pub struct MinuteLogConfig {
    /// Time since the last update after which a minute is flushed.
    pub ttl: Duration,
    /// Sync mode for WAL files.
    pub sync_mode: SyncMode,
}

impl Default for MinuteLogConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_MINUTE_TTL,
            sync_mode: SyncMode::default(),
        }
    }
}

impl MinuteLogConfig {
    /// Sets the time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Durable buffer placed in front of the memtable.
#[derive(Debug, Clone, Default)]
pub enum DurabilityConfig {
    /// No WAL. A failed memtable flush loses the rest of its chunk.
    #[default]
    None,
    /// Pending list flushed to dedicated WAL files.
    PendingLog(PendingLogConfig),
    /// Per-minute holders flushed as page files once cooled.
    MinuteLog(MinuteLogConfig),
}

/// Configuration for day compaction.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Files a day may hold before it is compacted.
    pub max_files_per_day: usize,
    /// Compression for pages written by the compactor.
    pub compression: CompressionType,
    /// Sync mode for compacted files.
    pub sync_mode: SyncMode,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_files_per_day: DEFAULT_MAX_FILES_PER_DAY,
            compression: CompressionType::None,
            sync_mode: SyncMode::default(),
        }
    }
}

impl CompactionConfig {
    /// Sets the file count threshold.
    pub fn with_max_files_per_day(mut self, max: usize) -> Self {
        self.max_files_per_day = max.max(1);
        self
    }

    /// Sets the output compression.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Writer configuration used for compaction output.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig::default()
            .with_compression(self.compression)
            .with_sync_mode(self.sync_mode)
    }
}

/// Top-level configuration of a [`LogStore`](crate::engine::LogStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding partition files.
    pub data_dir: PathBuf,
    /// Directory holding WAL files.
    pub wal_dir: PathBuf,
    /// Memtable thresholds.
    pub memtable: MemTableConfig,
    /// Partition file writer settings.
    pub writer: WriterConfig,
    /// Durable buffer selection.
    pub durability: DurabilityConfig,
    /// Compaction settings.
    pub compaction: CompactionConfig,
    /// Interval of the durable buffer background tick.
    pub tick_interval: Duration,
}

impl StoreConfig {
    /// Creates a configuration rooted at `root`, using `root/data` and
    /// `root/wal`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            wal_dir: root.join("wal"),
            memtable: MemTableConfig::default(),
            writer: WriterConfig::default(),
            durability: DurabilityConfig::default(),
            compaction: CompactionConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// Sets the memtable configuration.
    pub fn with_memtable(mut self, memtable: MemTableConfig) -> Self {
        self.memtable = memtable;
        self
    }

    /// Sets the writer configuration.
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Sets the durable buffer.
    pub fn with_durability(mut self, durability: DurabilityConfig) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the compaction configuration.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Sets the durable buffer tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
