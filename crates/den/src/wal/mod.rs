//! Write-ahead durability buffers placed in front of the memtable.
//!
//! Two variants implement [`DurableBuffer`]:
//!
//! - [`PendingLog`]: a pending list flushed to a dedicated WAL file once a
//!   byte, record-count, or time threshold trips.
//! - [`MinuteLog`]: per-minute holders flushed as page files once a minute
//!   has cooled for the configured TTL.
//!
//! Both stage every file as `<created-at-unix-nanos>.wal.dirty`, fsync it,
//! rename it atomically into place, and fsync the directory. A `.dirty` file
//! left behind means a flush was interrupted; [`ensure_clean`] refuses to
//! start on top of one.
//!
//! ```text
//! append(seq, record) ──► pending state ──flush──► *.wal.dirty ──rename──► *.wal
//!                                                                    │
//!                                        release(safe_seq) ◄─────────┘
//! ```

pub mod minute;
pub mod pending;

pub use minute::{read_minute_wal_file, MinuteLog};
pub use pending::{read_wal_file, PendingLog, WalFile, WalFileHeader};

use crate::config::{DurabilityConfig, SyncMode};
use crate::error::{DenError, Result};
use crate::format::LogRecord;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// WAL file extension.
pub const WAL_EXTENSION: &str = "wal";

/// Suffix appended to WAL files while they are being written.
pub const DIRTY_SUFFIX: &str = "dirty";

/// A durability buffer in front of the memtable.
///
/// Records are appended with the sequence number the engine assigned them.
/// Files are deleted by [`DurableBuffer::release`] once every record they
/// hold is persisted in the page store.
pub trait DurableBuffer: Send {
    /// Buffers a record.
    fn append(&mut self, seq: u64, record: &LogRecord) -> Result<()>;

    /// Time-triggered flush, called periodically.
    fn tick(&mut self) -> Result<()>;

    /// Flushes buffered records. `force` ignores thresholds and TTLs.
    fn flush(&mut self, force: bool) -> Result<()>;

    /// Deletes files whose records all have a sequence `<= up_to_seq`.
    ///
    /// Returns the number of deleted files.
    fn release(&mut self, up_to_seq: u64) -> Result<usize>;

    /// Records buffered in memory and not yet written to a WAL file.
    fn pending(&self) -> usize;

    /// WAL files written by this buffer and not yet released.
    fn live_files(&self) -> usize;
}

/// Builds the durable buffer selected by `config`, or `None` when disabled.
pub fn open_buffer(dir: &Path, config: &DurabilityConfig) -> Result<Option<Box<dyn DurableBuffer>>> {
    let buffer: Box<dyn DurableBuffer> = match config {
        DurabilityConfig::None => return Ok(None),
        DurabilityConfig::PendingLog(config) => Box::new(PendingLog::new(dir, config.clone())?),
        DurabilityConfig::MinuteLog(config) => Box::new(MinuteLog::new(dir, config.clone())?),
    };
    Ok(Some(buffer))
}

/// Fails with [`DenError::DirtyWal`] if `dir` holds an interrupted flush.
///
/// Creates the directory when it does not exist. Complete WAL files left by
/// an earlier run are reported but not replayed.
pub fn ensure_clean(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut leftovers = 0usize;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(DIRTY_SUFFIX) => return Err(DenError::DirtyWal(path)),
            Some(WAL_EXTENSION) => leftovers += 1,
            _ => {}
        }
    }

    if leftovers > 0 {
        warn!(
            "{} WAL files from an earlier run found in {}; they are kept for manual replay",
            leftovers,
            dir.display()
        );
    }
    Ok(())
}

/// Lists complete WAL files in `dir`, oldest first.
pub fn list_wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == WAL_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Hands out strictly increasing creation stamps for WAL file names.
#[derive(Debug, Default)]
pub(crate) struct FileStamp {
    last: i64,
}

impl FileStamp {
    pub(crate) fn next(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Final and staging paths of a WAL file created at `created_at`.
pub(crate) fn wal_paths(dir: &Path, created_at: i64) -> (PathBuf, PathBuf) {
    let name = format!("{:020}.{}", created_at, WAL_EXTENSION);
    let path = dir.join(&name);
    let dirty = dir.join(format!("{}.{}", name, DIRTY_SUFFIX));
    (path, dirty)
}

/// Renames a synced staging file into place and syncs the directory.
pub(crate) fn commit_staged(dirty: &Path, path: &Path, sync_mode: SyncMode) -> Result<()> {
    fs::rename(dirty, path)?;
    if let Some(dir) = path.parent() {
        sync_mode.sync_dir(dir)?;
    }
    Ok(())
}

/// Removes a staging file after a failed flush.
pub(crate) fn discard_staged(dirty: &Path) {
    if let Err(e) = fs::remove_file(dirty) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staging WAL file {}: {}", dirty.display(), e);
        }
    }
}

/// Written WAL files and the highest sequence each one holds.
#[derive(Debug)]
pub(crate) struct ReleaseLedger {
    dir: PathBuf,
    files: Vec<(PathBuf, u64)>,
}

impl ReleaseLedger {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, path: PathBuf, max_seq: u64) {
        self.files.push((path, max_seq));
    }

    pub(crate) fn len(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn release(&mut self, up_to_seq: u64, sync_mode: SyncMode) -> Result<usize> {
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.files.len());
        let mut failure = None;

        for (path, max_seq) in self.files.drain(..) {
            if max_seq > up_to_seq || failure.is_some() {
                kept.push((path, max_seq));
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Released WAL file {} (max seq {})", path.display(), max_seq);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => {
                    kept.push((path, max_seq));
                    failure = Some(e);
                }
            }
        }
        self.files = kept;

        if removed > 0 {
            sync_mode.sync_dir(&self.dir)?;
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }
}
