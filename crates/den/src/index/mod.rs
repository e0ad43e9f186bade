//! Time-based partition index.
//!
//! Maps each calendar day to the partition files holding it, ordered by file
//! id, and decides where an incoming record is written. Every file is
//! represented by a shared [`IndexItem`] that also arbitrates file access.

pub mod access;

pub use access::{AccessGate, AccessState, ReadAccess, WriteAccess};

use crate::config::WriterConfig;
use crate::error::{DenError, Result};
use crate::format::{DayKey, FileHeader, LogRecord};
use crate::page::{DataFileInfo, PageFileReader, PageFileWriter};
use crate::query::TimeRange;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix of compaction outputs that were not renamed into place.
pub const TEMP_SUFFIX: &str = "tmp";

/// A partition file known to the index.
#[derive(Debug)]
pub struct IndexItem {
    day: DayKey,
    file_id: u64,
    path: PathBuf,
    header: Mutex<FileHeader>,
    gate: AccessGate,
}

impl IndexItem {
    /// Creates an item for a file with the given header.
    pub fn new(path: PathBuf, header: FileHeader) -> Self {
        Self {
            day: header.day,
            file_id: header.file_id,
            path,
            header: Mutex::new(header),
            gate: AccessGate::new(),
        }
    }

    /// Day partitioned by the file.
    pub fn day(&self) -> DayKey {
        self.day
    }

    /// File id.
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last published header.
    pub fn header(&self) -> FileHeader {
        self.header.lock().clone()
    }

    /// Last page according to the published header.
    pub fn last_page(&self) -> Option<u16> {
        self.header.lock().last_page
    }

    /// Publishes a new header.
    pub fn set_header(&self, header: FileHeader) {
        *self.header.lock() = header;
    }

    /// Access gate of the file.
    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Current access state.
    pub fn access_state(&self) -> AccessState {
        self.gate.state()
    }

    /// Takes read access if no writer holds the file.
    pub fn request_read(self: &Arc<Self>) -> Option<ReadAccess> {
        self.gate
            .try_read()
            .then(|| ReadAccess::new(Arc::clone(self)))
    }

    /// Takes write access if nobody holds the file.
    pub fn request_write(self: &Arc<Self>) -> Option<WriteAccess> {
        self.gate
            .try_write()
            .then(|| WriteAccess::new(Arc::clone(self)))
    }

    /// Blocks until read access is granted.
    pub fn await_read(self: &Arc<Self>) -> ReadAccess {
        self.gate.wait_read();
        ReadAccess::new(Arc::clone(self))
    }

    /// Blocks until write access is granted.
    pub fn await_write(self: &Arc<Self>) -> WriteAccess {
        self.gate.wait_write();
        WriteAccess::new(Arc::clone(self))
    }
}

/// What the writer must do before appending a record to the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    /// The file's last page is the record's minute; append to it.
    Continue,
    /// Open a new page for the record's minute.
    OpenPage,
}

/// File chosen for a record by [`PartitionIndex::get_data_file_for_write`].
#[derive(Debug, Clone)]
pub struct WriteTarget {
    /// Target file.
    pub item: Arc<IndexItem>,
    /// Page action required before the append.
    pub action: PageAction,
}

/// Day-partitioned index of data files.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::index::PartitionIndex;
///
/// let index = PartitionIndex::bind_storage(dir, WriterConfig::default())?;
/// let target = index.get_data_file_for_write(&record)?;
/// ```
#[derive(Debug)]
pub struct PartitionIndex {
    dir: PathBuf,
    writer_config: WriterConfig,
    files: RwLock<BTreeMap<DayKey, Vec<Arc<IndexItem>>>>,
    next_file_id: AtomicU64,
}

impl PartitionIndex {
    /// Rebuilds the index from the partition files found in `dir`.
    ///
    /// Files whose header cannot be read, or whose header disagrees with the
    /// file name, are logged and skipped. Stale compaction outputs are removed.
    pub fn bind_storage(dir: &Path, writer_config: WriterConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut files: BTreeMap<DayKey, Vec<Arc<IndexItem>>> = BTreeMap::new();
        let mut max_id = 0u64;
        let mut skipped = 0usize;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == TEMP_SUFFIX) {
                warn!("Removing stale compaction output {}", path.display());
                fs::remove_file(&path)?;
                continue;
            }
            let Some(info) = DataFileInfo::from_path(&path) else {
                continue;
            };
            max_id = max_id.max(info.file_id);

            match Self::load_header(&info) {
                Ok(header) => {
                    files
                        .entry(info.day)
                        .or_default()
                        .push(Arc::new(IndexItem::new(path, header)));
                }
                Err(e) => {
                    warn!("Skipping partition file {}: {}", path.display(), e);
                    skipped += 1;
                }
            }
        }

        for items in files.values_mut() {
            items.sort_by_key(|item| item.file_id());
        }
        let count: usize = files.values().map(Vec::len).sum();
        info!(
            "Bound {} partition files over {} days in {} ({} skipped)",
            count,
            files.len(),
            dir.display(),
            skipped
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            writer_config,
            files: RwLock::new(files),
            next_file_id: AtomicU64::new(max_id + 1),
        })
    }

    fn load_header(info: &DataFileInfo) -> Result<FileHeader> {
        let mut reader = PageFileReader::open(&info.path)?;
        let header = reader.header()?.clone();
        if header.day != info.day {
            return Err(DenError::FileMismatch {
                expected: info.day,
                actual: header.day,
            });
        }
        if header.file_id != info.file_id {
            return Err(DenError::Corrupted(format!(
                "header file id {} differs from name id {}",
                header.file_id, info.file_id
            )));
        }
        Ok(header)
    }

    /// Data directory.
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// Writer configuration used for new files.
    pub fn writer_config(&self) -> &WriterConfig {
        &self.writer_config
    }

    /// Reserves a fresh file id.
    pub fn allocate_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Chooses the file a record is written to.
    ///
    /// Creates the day's first file when none exists. Otherwise the newest
    /// file of the day is used; a record behind its last page is rejected
    /// with [`DenError::PastWrite`].
    pub fn get_data_file_for_write(&self, record: &LogRecord) -> Result<WriteTarget> {
        let day = record.day()?;
        let minute = record.minute();

        let mut files = self.files.write();
        if let Some(item) = files.get(&day).and_then(|items| items.last()) {
            let action = match item.last_page() {
                None => PageAction::OpenPage,
                Some(last) if last < minute => PageAction::OpenPage,
                Some(last) if last == minute => PageAction::Continue,
                Some(last) => {
                    return Err(DenError::PastWrite {
                        day,
                        minute,
                        cursor_day: day,
                        cursor_page: last,
                    })
                }
            };
            return Ok(WriteTarget {
                item: Arc::clone(item),
                action,
            });
        }

        let item = self.create_file(day)?;
        files.entry(day).or_default().push(Arc::clone(&item));
        Ok(WriteTarget {
            item,
            action: PageAction::OpenPage,
        })
    }

    fn create_file(&self, day: DayKey) -> Result<Arc<IndexItem>> {
        let file_id = self.allocate_file_id();
        let path = DataFileInfo::path_in(&self.dir, day, file_id);
        let writer = PageFileWriter::create(&path, day, file_id, self.writer_config.clone())?;
        let header = writer.close()?;
        self.writer_config.sync_mode.sync_dir(&self.dir)?;

        info!("Created partition file {}", path.display());
        Ok(Arc::new(IndexItem::new(path, header)))
    }

    /// Creates an additional, empty file for `day` and registers it.
    ///
    /// Used when the newest file of the day cannot take more records on its
    /// last page, for example because that page is compressed.
    pub fn create_data_file(&self, day: DayKey) -> Result<Arc<IndexItem>> {
        let item = self.create_file(day)?;
        let mut files = self.files.write();
        let items = files.entry(day).or_default();
        let at = items.partition_point(|existing| existing.file_id() < item.file_id());
        items.insert(at, Arc::clone(&item));
        Ok(item)
    }

    /// Files whose day overlaps `range`, in day then file id order.
    pub fn get_data_files_for_read(&self, range: &TimeRange) -> Vec<Arc<IndexItem>> {
        let files = self.files.read();
        files
            .iter()
            .filter(|(day, _)| range.overlaps(day.start_timestamp(), day.end_timestamp()))
            .flat_map(|(_, items)| items.iter().cloned())
            .collect()
    }

    /// Publishes a header written by the orchestrator or the compactor.
    pub fn update_header(&self, item: &IndexItem, header: FileHeader) {
        debug!(
            "Index header update for {}: pages {:?}, {} records",
            item.path().display(),
            header.page_range(),
            header.record_count
        );
        item.set_header(header);
    }

    /// Registers an existing file, keeping the day's list ordered by file id.
    pub fn register_file(&self, path: PathBuf, header: FileHeader) -> Arc<IndexItem> {
        let item = Arc::new(IndexItem::new(path, header));
        let mut files = self.files.write();
        let items = files.entry(item.day()).or_default();
        let at = items.partition_point(|existing| existing.file_id() < item.file_id());
        items.insert(at, Arc::clone(&item));
        item
    }

    /// Removes a file from the index. Returns false if it was not indexed.
    pub fn remove_file(&self, item: &IndexItem) -> bool {
        let mut files = self.files.write();
        let Some(items) = files.get_mut(&item.day()) else {
            return false;
        };
        let before = items.len();
        items.retain(|existing| existing.file_id() != item.file_id());
        let removed = items.len() != before;
        if items.is_empty() {
            files.remove(&item.day());
        }
        removed
    }

    /// Indexed days, ascending.
    pub fn days(&self) -> Vec<DayKey> {
        self.files.read().keys().copied().collect()
    }

    /// Files of `day`, ordered by file id.
    pub fn files_for_day(&self, day: DayKey) -> Vec<Arc<IndexItem>> {
        self.files.read().get(&day).cloned().unwrap_or_default()
    }

    /// Total number of indexed files.
    pub fn file_count(&self) -> usize {
        self.files.read().values().map(Vec::len).sum()
    }
}
