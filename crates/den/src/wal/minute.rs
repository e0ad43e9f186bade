//! Minute-holder WAL: records are grouped by `(day, minute)` and written as
//! page files once a minute has gone quiet for the configured TTL.
//!
//! Each flush writes one file per day, holding one page per drained minute,
//! using the same page file format as partition files.

use super::{commit_staged, discard_staged, wal_paths, DurableBuffer, FileStamp, ReleaseLedger};
use crate::config::{MinuteLogConfig, WriterConfig};
use crate::error::Result;
use crate::format::{DayKey, LogRecord};
use crate::page::{PageFileReader, PageFileWriter};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct MinuteHolder {
    records: Vec<(u64, LogRecord)>,
    last_update: Instant,
}

/// Per-minute durability buffer.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::wal::{DurableBuffer, MinuteLog};
///
/// let mut wal = MinuteLog::new(dir, MinuteLogConfig::default())?;
/// wal.append(1, &record)?;
/// wal.tick()?; // drains minutes idle for longer than the TTL
/// ```
#[derive(Debug)]
pub struct MinuteLog {
    dir: PathBuf,
    config: MinuteLogConfig,
    holders: BTreeMap<(DayKey, u16), MinuteHolder>,
    pending: usize,
    stamp: FileStamp,
    ledger: ReleaseLedger,
}

impl MinuteLog {
    /// Creates a minute-holder WAL writing into `dir`.
    pub fn new(dir: &Path, config: MinuteLogConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            holders: BTreeMap::new(),
            pending: 0,
            stamp: FileStamp::default(),
            ledger: ReleaseLedger::new(dir),
        })
    }

    /// Minutes of `day` currently held, newest first.
    pub fn minutes_desc(&self, day: DayKey) -> Vec<u16> {
        self.holders
            .range((day, 0)..=(day, u16::MAX))
            .rev()
            .filter(|(_, holder)| !holder.records.is_empty())
            .map(|((_, minute), _)| *minute)
            .collect()
    }

    /// Number of minute holders.
    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    fn drain_due(&mut self, force: bool) -> BTreeMap<DayKey, Vec<(u16, MinuteHolder)>> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let due: Vec<(DayKey, u16)> = self
            .holders
            .iter()
            .filter(|(_, holder)| !holder.records.is_empty())
            .filter(|(_, holder)| force || now.duration_since(holder.last_update) >= ttl)
            .map(|(key, _)| *key)
            .collect();

        let mut by_day: BTreeMap<DayKey, Vec<(u16, MinuteHolder)>> = BTreeMap::new();
        for key in due {
            if let Some(holder) = self.holders.remove(&key) {
                by_day.entry(key.0).or_default().push((key.1, holder));
            }
        }
        by_day
    }

    fn restore(&mut self, day: DayKey, minutes: Vec<(u16, MinuteHolder)>) {
        for (minute, holder) in minutes {
            self.holders.insert((day, minute), holder);
        }
    }

    fn write_day(
        &self,
        created_at: i64,
        day: DayKey,
        minutes: &[(u16, MinuteHolder)],
        path: &Path,
        dirty: &Path,
    ) -> Result<u64> {
        let config = WriterConfig::default().with_sync_mode(self.config.sync_mode);
        let mut writer = PageFileWriter::create(dirty, day, created_at as u64, config)?;
        let mut max_seq = 0;

        for (minute, holder) in minutes {
            writer.append_page(*minute)?;
            for (seq, record) in &holder.records {
                writer.append_record(record)?;
                max_seq = max_seq.max(*seq);
            }
        }
        writer.close()?;

        commit_staged(dirty, path, self.config.sync_mode)?;
        Ok(max_seq)
    }
}

impl DurableBuffer for MinuteLog {
    fn append(&mut self, seq: u64, record: &LogRecord) -> Result<()> {
        let key = (record.day()?, record.minute());
        let holder = self.holders.entry(key).or_insert_with(|| MinuteHolder {
            records: Vec::new(),
            last_update: Instant::now(),
        });
        holder.records.push((seq, record.clone()));
        holder.last_update = Instant::now();
        self.pending += 1;
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.flush(false)
    }

    fn flush(&mut self, force: bool) -> Result<()> {
        let mut days = self.drain_due(force).into_iter();

        while let Some((day, mut minutes)) = days.next() {
            let count: usize = minutes.iter().map(|(_, h)| h.records.len()).sum();
            for (_, holder) in minutes.iter_mut() {
                holder.records.sort_by_key(|(_, record)| record.timestamp);
            }

            let created_at = self.stamp.next();
            let (path, dirty) = wal_paths(&self.dir, created_at);
            match self.write_day(created_at, day, &minutes, &path, &dirty) {
                Ok(max_seq) => {
                    debug!(
                        "Flushed {} minutes ({} records) of {} to {}",
                        minutes.len(),
                        count,
                        day,
                        path.display()
                    );
                    self.pending -= count;
                    self.ledger.record(path, max_seq);
                }
                Err(e) => {
                    error!("Failed to flush minute WAL for {}: {}", day, e);
                    discard_staged(&dirty);
                    self.restore(day, minutes);
                    for (day, minutes) in days.by_ref() {
                        self.restore(day, minutes);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn release(&mut self, up_to_seq: u64) -> Result<usize> {
        self.ledger.release(up_to_seq, self.config.sync_mode)
    }

    fn pending(&self) -> usize {
        self.pending
    }

    fn live_files(&self) -> usize {
        self.ledger.len()
    }
}

impl Drop for MinuteLog {
    fn drop(&mut self) {
        if self.pending > 0 {
            if let Err(e) = self.flush(true) {
                warn!("Failed to flush minute WAL on drop: {}", e);
            }
        }
    }
}

/// Reads every record of a minute-holder WAL file in page order.
pub fn read_minute_wal_file(path: &Path) -> Result<Vec<LogRecord>> {
    PageFileReader::open(path)?.read_all()
}
