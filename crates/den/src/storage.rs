//! Storage orchestrator: routes records into partition files and evaluates
//! queries against them.
//!
//! All writers share one [`WriteCursor`], owned by [`Storage`] behind a
//! mutex. The cursor keeps the newest partition file open and only ever moves
//! forward in `(day, minute)` order:
//!
//! ```text
//! record (day, minute)
//!   behind cursor        -> PastWrite
//!   later day            -> finalize open file, open the day's file via the index
//!   later minute         -> append_page(minute)
//!   same minute          -> append_record
//! ```
//!
//! Write access on the open file is taken lazily by a [`WriteSession`] and
//! released when the session finishes, so queries are admitted between
//! sessions.

use crate::config::{CompactionConfig, StoreConfig, WriterConfig};
use crate::error::{DenError, Result};
use crate::format::{DayKey, LogRecord};
use crate::index::{IndexItem, PartitionIndex, WriteAccess};
use crate::lifecycle::{CompactionReport, Compactor};
use crate::memtable::{FlushOutcome, FlushSink, FrozenBuffer};
use crate::page::PageFileWriter;
use crate::query::{self, PreparedQuery, QueryResult};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct OpenFile {
    item: Arc<IndexItem>,
    writer: PageFileWriter,
    access: Option<WriteAccess>,
}

/// Position of the single write stream.
#[derive(Default)]
pub struct WriteCursor {
    open: Option<OpenFile>,
}

impl WriteCursor {
    /// Creates a cursor with no open file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Day of the open file.
    pub fn day(&self) -> Option<DayKey> {
        self.open.as_ref().map(|open| open.item.day())
    }

    /// Page the open file is positioned on.
    pub fn page(&self) -> Option<u16> {
        self.open.as_ref().and_then(|open| open.writer.current_page())
    }

    /// Writes `record`, moving the cursor forward as needed.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PastWrite` if the record is behind the cursor or
    /// behind the newest file of its day.
    pub fn store(
        &mut self,
        index: &PartitionIndex,
        config: &WriterConfig,
        record: &LogRecord,
    ) -> Result<()> {
        let day = record.day()?;
        let minute = record.minute();

        if let Some(open) = &self.open {
            let cursor_day = open.item.day();
            let cursor_page = open.writer.current_page();
            let behind = day < cursor_day
                || (day == cursor_day && cursor_page.is_some_and(|page| minute < page));
            if behind {
                return Err(DenError::PastWrite {
                    day,
                    minute,
                    cursor_day,
                    cursor_page: cursor_page.unwrap_or(0),
                });
            }
            if day > cursor_day {
                self.finalize(index)?;
            }
        }

        if self.open.is_none() {
            let target = index.get_data_file_for_write(record)?;
            self.open_file(target.item, config)?;
        }

        match self.append(minute, record) {
            Err(DenError::AlreadyCompressed(page)) => {
                debug!(
                    "Page {} of {} is sealed, starting a new file for {}",
                    page,
                    self.open_path(),
                    day
                );
                self.finalize(index)?;
                let item = index.create_data_file(day)?;
                self.open_file(item, config)?;
                self.append(minute, record)
            }
            other => other,
        }
    }

    fn open_path(&self) -> String {
        self.open
            .as_ref()
            .map(|open| open.item.path().display().to_string())
            .unwrap_or_default()
    }

    fn open_file(&mut self, item: Arc<IndexItem>, config: &WriterConfig) -> Result<()> {
        let access = item.await_write();
        let writer = PageFileWriter::open(item.path(), config.clone())?;
        debug!("Write cursor opened {}", item.path().display());
        self.open = Some(OpenFile {
            item,
            writer,
            access: Some(access),
        });
        Ok(())
    }

    fn append(&mut self, minute: u16, record: &LogRecord) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Err(DenError::PageNotSelected);
        };
        if open.access.is_none() {
            open.access = Some(open.item.await_write());
        }
        if open.writer.current_page() != Some(minute) {
            open.writer.append_page(minute)?;
        }
        open.writer.append_record(record)
    }

    /// Syncs the open file, publishes its header and releases write access.
    pub fn release(&mut self, index: &PartitionIndex) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        let Some(access) = open.access.take() else {
            return Ok(());
        };
        let result = open.writer.sync();
        if result.is_ok() {
            index.update_header(&open.item, open.writer.header().clone());
        }
        drop(access);
        result
    }

    /// Closes the open file and publishes its final header.
    pub fn finalize(&mut self, index: &PartitionIndex) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        if open.access.is_none() {
            open.access = Some(open.item.await_write());
        }
        let header = open.writer.close()?;
        debug!(
            "Write cursor closed {} ({} records)",
            open.item.path().display(),
            header.record_count
        );
        index.update_header(&open.item, header);
        Ok(())
    }
}

/// Exclusive handle on the write cursor.
///
/// Dropping a session without [`WriteSession::finish`] releases it on a
/// best-effort basis.
pub struct WriteSession<'a> {
    index: &'a PartitionIndex,
    config: &'a WriterConfig,
    cursor: MutexGuard<'a, WriteCursor>,
    finished: bool,
}

impl WriteSession<'_> {
    /// Writes one record through the cursor.
    pub fn store(&mut self, record: &LogRecord) -> Result<()> {
        self.cursor.store(self.index, self.config, record)
    }

    /// Syncs the written data and releases write access.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.cursor.release(self.index)
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.cursor.release(self.index) {
                warn!("Failed to release write session on drop: {}", e);
            }
        }
    }
}

/// Partition storage: index, write cursor, and compaction entry point.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::storage::Storage;
///
/// let storage = Storage::open(&StoreConfig::new("/var/lib/den"))?;
/// storage.store_log_record(&record)?;
/// let result = storage.query(&LabelQuery::new(TimeRange::all()))?;
/// ```
pub struct Storage {
    index: Arc<PartitionIndex>,
    cursor: Mutex<WriteCursor>,
    writer_config: WriterConfig,
    compaction: CompactionConfig,
    closed: AtomicBool,
}

impl Storage {
    /// Binds the data directory of `config`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::UnsupportedCompression` if the writer or compaction
    /// compression has no codec.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.writer.validate()?;
        config.compaction.writer_config().validate()?;
        let index = PartitionIndex::bind_storage(&config.data_dir, config.writer.clone())?;
        Ok(Self {
            index: Arc::new(index),
            cursor: Mutex::new(WriteCursor::new()),
            writer_config: config.writer.clone(),
            compaction: config.compaction.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// The partition index.
    pub fn index(&self) -> &Arc<PartitionIndex> {
        &self.index
    }

    /// Locks the write cursor.
    pub fn session(&self) -> Result<WriteSession<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DenError::Closed);
        }
        Ok(WriteSession {
            index: &self.index,
            config: &self.writer_config,
            cursor: self.cursor.lock(),
            finished: false,
        })
    }

    /// Writes a single record in its own session.
    pub fn store_log_record(&self, record: &LogRecord) -> Result<()> {
        let mut session = self.session()?;
        session.store(record)?;
        session.finish()
    }

    /// Evaluates a query over the indexed files.
    pub fn query(&self, query: &dyn PreparedQuery) -> Result<QueryResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DenError::Closed);
        }
        Ok(query::execute(&self.index, query))
    }

    /// Merges the files of `day` down to the configured maximum.
    ///
    /// The write cursor is finalized first if it is positioned on `day`, and
    /// stays locked while the day is compacted.
    pub fn compact_day(&self, day: DayKey) -> Result<CompactionReport> {
        let mut session = self.session()?;
        if session.cursor.day() == Some(day) {
            session.cursor.finalize(&self.index)?;
        }
        let compactor = Compactor::new(Arc::clone(&self.index), self.compaction.clone());
        let report = compactor.compact_day(day);
        session.finish()?;
        report
    }

    /// Compacts every day holding more files than the configured maximum.
    pub fn compact_all(&self) -> Result<Vec<CompactionReport>> {
        let mut reports = Vec::new();
        for day in self.index.days() {
            if self.index.files_for_day(day).len() > self.compaction.max_files_per_day {
                reports.push(self.compact_day(day)?);
            }
        }
        Ok(reports)
    }

    /// Finalizes the write cursor and rejects further use.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cursor.lock().finalize(&self.index)?;
        info!("Storage in {} closed", self.index.data_dir().display());
        Ok(())
    }
}

/// Returns true for errors that concern a single record rather than the file.
fn is_record_error(error: &DenError) -> bool {
    matches!(
        error,
        DenError::PastWrite { .. }
            | DenError::InvalidTimestamp(_)
            | DenError::RecordTooLarge(_)
            | DenError::InvalidLabel(_)
    )
}

impl FlushSink for Storage {
    /// Writes a chunk in one session.
    ///
    /// On a storage failure every record of the session goes back into the
    /// chunk, since none of them is known to be durable.
    fn flush_chunk(&self, chunk: &mut FrozenBuffer) -> Result<FlushOutcome> {
        let mut session = self.session()?;
        let mut written = Vec::with_capacity(chunk.len());
        let mut rejected = 0;

        while let Some(entry) = chunk.pop() {
            match session.store(&entry.record) {
                Ok(()) => written.push(entry),
                Err(e) if is_record_error(&e) => {
                    warn!("Dropping record seq {}: {}", entry.seq, e);
                    rejected += 1;
                }
                Err(e) => {
                    chunk.restore(entry);
                    written.into_iter().for_each(|entry| chunk.restore(entry));
                    return Err(e);
                }
            }
        }

        if let Err(e) = session.finish() {
            written.into_iter().for_each(|entry| chunk.restore(entry));
            return Err(e);
        }
        Ok(FlushOutcome {
            written: written.len(),
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionType;
    use crate::config::SyncMode;
    use crate::query::{LabelQuery, TimeRange};
    use tempfile::TempDir;

    // 2024-01-01 00:00:00 UTC
    const DAY_START: i64 = 1_704_067_200;

    fn open_storage(dir: &TempDir) -> Storage {
        let config = StoreConfig::new(dir.path())
            .with_writer(WriterConfig::default().with_sync_mode(SyncMode::None));
        Storage::open(&config).unwrap()
    }

    fn record(ts: i64) -> LogRecord {
        LogRecord::new(ts, 1).with_message(format!("at {ts}"))
    }

    #[test]
    fn test_open_rejects_unsupported_compaction_compression() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_compaction(
            CompactionConfig::default().with_compression(CompressionType::Snappy),
        );
        assert!(matches!(
            Storage::open(&config),
            Err(DenError::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn test_store_moves_through_pages() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        storage.store_log_record(&record(DAY_START + 1)).unwrap();
        storage.store_log_record(&record(DAY_START + 2)).unwrap();
        storage.store_log_record(&record(DAY_START + 125)).unwrap();

        let items = storage.index().files_for_day(DayKey::from_timestamp(DAY_START).unwrap());
        assert_eq!(items.len(), 1);
        let header = items[0].header();
        assert_eq!(header.page_range(), Some((0, 2)));
        assert_eq!(header.record_count, 3);
    }

    #[test]
    fn test_past_write_behind_cursor() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        storage.store_log_record(&record(DAY_START + 300)).unwrap();
        match storage.store_log_record(&record(DAY_START + 60)) {
            Err(DenError::PastWrite {
                minute,
                cursor_page,
                ..
            }) => assert_eq!((minute, cursor_page), (1, 5)),
            other => panic!("expected PastWrite, got {:?}", other),
        }
        // Same minute is still accepted.
        storage.store_log_record(&record(DAY_START + 301)).unwrap();
    }

    #[test]
    fn test_past_write_across_days() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        // 2024-01-01 00:00:00, then 2023-12-31 23:59:00
        storage.store_log_record(&record(DAY_START)).unwrap();
        let result = storage.store_log_record(&record(DAY_START - 60));
        assert!(matches!(result, Err(DenError::PastWrite { .. })));
    }

    #[test]
    fn test_day_change_finalizes_file() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        storage.store_log_record(&record(DAY_START + 10)).unwrap();
        storage.store_log_record(&record(DAY_START + 86_400 + 10)).unwrap();
        assert_eq!(storage.index().days().len(), 2);
        assert_eq!(storage.index().file_count(), 2);

        let result = storage.query(&LabelQuery::new(TimeRange::all())).unwrap();
        assert_eq!(result.records.len(), 2);
    }

    #[test]
    fn test_query_admitted_between_sessions() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);
        storage.store_log_record(&record(DAY_START)).unwrap();

        let item = storage.index().files_for_day(DayKey::from_timestamp(DAY_START).unwrap())[0].clone();
        assert!(item.request_read().is_some());

        let mut session = storage.session().unwrap();
        session.store(&record(DAY_START + 1)).unwrap();
        assert!(item.request_read().is_none());
        session.finish().unwrap();
        assert!(item.request_read().is_some());
    }

    #[test]
    fn test_reopen_continues_existing_file() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open_storage(&dir);
            storage.store_log_record(&record(DAY_START + 61)).unwrap();
            storage.close().unwrap();
            assert!(matches!(
                storage.store_log_record(&record(DAY_START + 62)),
                Err(DenError::Closed)
            ));
        }

        let storage = open_storage(&dir);
        storage.store_log_record(&record(DAY_START + 62)).unwrap();
        storage.store_log_record(&record(DAY_START + 121)).unwrap();
        assert!(matches!(
            storage.store_log_record(&record(DAY_START + 1)),
            Err(DenError::PastWrite { .. })
        ));
        storage.close().unwrap();

        let storage = open_storage(&dir);
        assert_eq!(storage.index().file_count(), 1);
        let result = storage.query(&LabelQuery::new(TimeRange::all())).unwrap();
        let timestamps: Vec<i64> = result.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            timestamps,
            vec![DAY_START + 61, DAY_START + 62, DAY_START + 121]
        );
    }
}
