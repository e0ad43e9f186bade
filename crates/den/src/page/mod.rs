//! Page-structured partition files.
//!
//! A partition file holds every record of one calendar day, grouped into
//! one page per minute. Pages are appended in strictly ascending page number
//! order by [`PageFileWriter`] and streamed back by [`PageFileReader`].

pub mod reader;
pub mod writer;

pub use reader::{PageFileReader, PageReader};
pub use writer::PageFileWriter;

use crate::format::DayKey;
use std::path::{Path, PathBuf};

/// Partition file extension.
pub const DATA_FILE_EXTENSION: &str = "den";

/// Identity of a partition file, parsed from its name.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::page::DataFileInfo;
///
/// let name = DataFileInfo::file_name(day, 7);
/// let parsed = DataFileInfo::parse_file_name(&name);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileInfo {
    /// Day the file partitions.
    pub day: DayKey,
    /// Store-unique file id.
    pub file_id: u64,
    /// Full file path.
    pub path: PathBuf,
}

impl DataFileInfo {
    /// Builds a file name using `{yyyy}-{mm}-{dd}.{file_id}.den`.
    pub fn file_name(day: DayKey, file_id: u64) -> String {
        format!("{}.{}.{}", day, file_id, DATA_FILE_EXTENSION)
    }

    /// Builds the full path of a partition file inside `dir`.
    pub fn path_in(dir: &Path, day: DayKey, file_id: u64) -> PathBuf {
        dir.join(Self::file_name(day, file_id))
    }

    /// Parses a file name into its day and file id.
    pub fn parse_file_name(name: &str) -> Option<(DayKey, u64)> {
        let name = name.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
        let (date, id) = name.split_once('.')?;
        let file_id = id.parse::<u64>().ok()?;

        let mut parts = date.split('-');
        let year = parts.next()?.parse::<u16>().ok()?;
        let month = parts.next()?.parse::<u8>().ok()?;
        let day = parts.next()?.parse::<u8>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        let day = DayKey::new(year, month, day).ok()?;
        Some((day, file_id))
    }

    /// Parses a path, returning `None` for files that are not partition files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (day, file_id) = Self::parse_file_name(name)?;
        Some(Self {
            day,
            file_id,
            path: path.to_path_buf(),
        })
    }
}
