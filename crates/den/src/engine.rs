//! Engine facade tying the durable buffer, the memtable and the storage
//! together.
//!
//! ```text
//! append(record)
//!   ingest lock: seq = next_seq++
//!   DurableBuffer::append(seq, record)      (optional WAL)
//!   MemTable::add(seq, record)
//!        |
//!        v  flusher thread
//!   Storage::flush_chunk  ->  partition files
//!   FlushSink::checkpoint(safe_seq)  ->  DurableBuffer::release(safe_seq)
//! ```
//!
//! A second background thread ticks the durable buffer so that interval and
//! TTL based WAL flushes happen without new appends.

use crate::config::StoreConfig;
use crate::error::{DenError, Result};
use crate::format::{DayKey, LogRecord};
use crate::lifecycle::CompactionReport;
use crate::memtable::{FlushOutcome, FlushSink, FrozenBuffer, MemTable};
use crate::query::{PreparedQuery, QueryResult};
use crate::storage::Storage;
use crate::wal::{self, DurableBuffer};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Converts raw ingested bytes into log records.
///
/// No adapters ship with the crate; callers plug in their own parser.
///
/// # Examples
/// ```rust,ignore
/// struct PlainText;
///
/// impl RecordTransformer for PlainText {
///     fn transform(&self, raw: &[u8]) -> Result<LogRecord> {
///         Ok(LogRecord::new(now(), 1).with_message(raw.to_vec()))
///     }
/// }
///
/// store.append_raw(&PlainText, b"service started")?;
/// ```
pub trait RecordTransformer {
    /// Parses `raw` into a record.
    fn transform(&self, raw: &[u8]) -> Result<LogRecord>;
}

type SharedBuffer = Arc<Mutex<Option<Box<dyn DurableBuffer>>>>;

/// Flush sink writing chunks to storage and releasing WAL files behind the
/// watermark.
struct EngineSink {
    storage: Arc<Storage>,
    buffer: SharedBuffer,
}

impl FlushSink for EngineSink {
    fn flush_chunk(&self, chunk: &mut FrozenBuffer) -> Result<FlushOutcome> {
        self.storage.flush_chunk(chunk)
    }

    fn checkpoint(&self, safe_seq: u64) {
        let mut buffer = self.buffer.lock();
        let Some(buffer) = buffer.as_mut() else {
            return;
        };
        match buffer.release(safe_seq) {
            Ok(0) => {}
            Ok(released) => debug!("Released {} WAL files up to seq {}", released, safe_seq),
            Err(e) => warn!("Failed to release WAL files up to seq {}: {}", safe_seq, e),
        }
    }
}

/// Background thread driving [`DurableBuffer::tick`].
struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn start(buffer: SharedBuffer, interval: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("den-wal-ticker".to_string())
            .spawn(move || {
                let (stopped, wake) = &*signal;
                let mut stopped = stopped.lock();
                while !*stopped {
                    if !wake.wait_for(&mut stopped, interval).timed_out() {
                        continue;
                    }
                    let mut buffer = buffer.lock();
                    if let Some(buffer) = buffer.as_mut() {
                        if let Err(e) = buffer.tick() {
                            error!("WAL tick failed: {}", e);
                        }
                    }
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) -> Result<()> {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("WAL ticker panicked"))?;
        }
        Ok(())
    }
}

/// Point-in-time counters of a [`LogStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Last assigned sequence number.
    pub last_seq: u64,
    /// Highest sequence number persisted in partition files.
    pub safe_seq: Option<u64>,
    /// Records in the active memtable buffer.
    pub buffered_records: usize,
    /// Chunks waiting for the flusher.
    pub queued_chunks: usize,
    /// Records written to partition files.
    pub records_written: u64,
    /// Records rejected by storage.
    pub records_rejected: u64,
    /// Records dropped by failed flushes.
    pub records_lost: u64,
    /// Records buffered by the WAL and not yet in a WAL file.
    pub wal_pending: usize,
    /// Unreleased WAL files.
    pub wal_files: usize,
    /// Indexed partition files.
    pub data_files: usize,
}

/// An open log store.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::{LabelQuery, LogRecord, LogStore, StoreConfig, TimeRange};
///
/// let store = LogStore::open(StoreConfig::new("/var/lib/den"))?;
/// store.append(LogRecord::new(1_704_067_200, 1).with_label("host", "a"))?;
/// store.flush()?;
/// let result = store.query(&LabelQuery::new(TimeRange::all()).with_label("host", "a"))?;
/// store.close()?;
/// ```
pub struct LogStore {
    config: StoreConfig,
    storage: Arc<Storage>,
    buffer: SharedBuffer,
    memtable: MemTable,
    next_seq: Mutex<u64>,
    ticker: Mutex<Option<Ticker>>,
    closed: AtomicBool,
}

impl LogStore {
    /// Opens a store.
    ///
    /// # Errors
    ///
    /// Returns `DenError::DirtyWal` if the WAL directory holds an interrupted
    /// flush from an earlier run.
    pub fn open(config: StoreConfig) -> Result<Self> {
        wal::ensure_clean(&config.wal_dir)?;
        let storage = Arc::new(Storage::open(&config)?);
        let buffer: SharedBuffer = Arc::new(Mutex::new(wal::open_buffer(
            &config.wal_dir,
            &config.durability,
        )?));

        let sink = Arc::new(EngineSink {
            storage: Arc::clone(&storage),
            buffer: Arc::clone(&buffer),
        });
        let memtable = MemTable::new(config.memtable.clone(), sink)?;

        let ticker = if buffer.lock().is_some() {
            Some(Ticker::start(Arc::clone(&buffer), config.tick_interval)?)
        } else {
            None
        };

        info!(
            "Log store opened: data {}, wal {}, {} files indexed",
            config.data_dir.display(),
            config.wal_dir.display(),
            storage.index().file_count()
        );
        Ok(Self {
            config,
            storage,
            buffer,
            memtable,
            next_seq: Mutex::new(0),
            ticker: Mutex::new(ticker),
            closed: AtomicBool::new(false),
        })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The storage orchestrator.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Appends a record, returning its sequence number.
    ///
    /// The record is validated up front so that neither the WAL nor the
    /// memtable ever holds a record the page store cannot encode.
    pub fn append(&self, record: LogRecord) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DenError::Closed);
        }
        record.day()?;
        record.meta()?;

        let mut next_seq = self.next_seq.lock();
        // A seq handed to the WAL is never reused, even if the append fails.
        *next_seq += 1;
        let seq = *next_seq;
        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.append(seq, &record)?;
        }
        self.memtable.add(seq, record)?;
        Ok(seq)
    }

    /// Parses `raw` with `transformer` and appends the result.
    pub fn append_raw(&self, transformer: &dyn RecordTransformer, raw: &[u8]) -> Result<u64> {
        let record = transformer.transform(raw)?;
        self.append(record)
    }

    /// Evaluates a query over the persisted records.
    ///
    /// Records still buffered in the memtable are not visible until flushed.
    pub fn query(&self, query: &dyn PreparedQuery) -> Result<QueryResult> {
        self.storage.query(query)
    }

    /// Flushes the memtable and waits until every chunk is drained.
    pub fn flush(&self) -> Result<()> {
        self.memtable.flush_and_wait()
    }

    /// Compacts the files of `day`.
    pub fn compact_day(&self, day: DayKey) -> Result<CompactionReport> {
        self.storage.compact_day(day)
    }

    /// Compacts every day holding too many files.
    pub fn compact_all(&self) -> Result<Vec<CompactionReport>> {
        self.storage.compact_all()
    }

    /// Lowest sequence numbers of the chunks whose flush failed.
    ///
    /// Each one holds back WAL release until it is passed to
    /// [`LogStore::resolve_failed_chunk`].
    pub fn failed_chunks(&self) -> Vec<u64> {
        self.memtable.watermark().failed_floors()
    }

    /// Marks the failed chunk starting at `min_seq` as recovered and releases
    /// the WAL files no longer held back, returning how many were removed.
    ///
    /// Call it once the chunk's records were replayed from the retained WAL
    /// files, or deliberately given up.
    pub fn resolve_failed_chunk(&self, min_seq: u64) -> Result<usize> {
        self.memtable.watermark().resolve_failure(min_seq);
        let Some(safe_seq) = self.memtable.safe_seq() else {
            return Ok(0);
        };
        let released = match self.buffer.lock().as_mut() {
            Some(buffer) => buffer.release(safe_seq)?,
            None => 0,
        };
        info!(
            "Failed chunk at seq {} resolved, watermark at {}, {} WAL files released",
            min_seq, safe_seq, released
        );
        Ok(released)
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> StoreStats {
        let memtable = self.memtable.stats();
        let (wal_pending, wal_files) = match self.buffer.lock().as_ref() {
            Some(buffer) => (buffer.pending(), buffer.live_files()),
            None => (0, 0),
        };
        StoreStats {
            last_seq: *self.next_seq.lock(),
            safe_seq: self.memtable.safe_seq(),
            buffered_records: memtable.buffered_records(),
            queued_chunks: memtable.queued_chunks(),
            records_written: memtable.records_written(),
            records_rejected: memtable.records_rejected(),
            records_lost: memtable.records_lost(),
            wal_pending,
            wal_files,
            data_files: self.storage.index().file_count(),
        }
    }

    /// Drains the memtable, flushes and releases the WAL, and finalizes the
    /// storage. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Appends racing with close either got their seq or see `Closed`.
        drop(self.next_seq.lock());

        self.memtable.close()?;
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.stop()?;
        }

        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.flush(true)?;
            if let Some(safe_seq) = self.memtable.safe_seq() {
                buffer.release(safe_seq)?;
            }
            if buffer.live_files() > 0 {
                warn!(
                    "{} WAL files kept in {}: their records were not all persisted",
                    buffer.live_files(),
                    self.config.wal_dir.display()
                );
            }
        }

        self.storage.close()?;
        info!("Log store in {} closed", self.config.data_dir.display());
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close log store on drop: {}", e);
        }
    }
}
