//! Error and Result types for Den storage operations.

use crate::format::DayKey;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Den operations.
pub type Result<T> = std::result::Result<T, DenError>;

/// The error type for Den storage operations.
#[derive(Debug, Error)]
pub enum DenError {
    /// Invalid magic bytes in a file header.
    #[error("Invalid magic bytes: got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Header or entry checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum stored on disk.
        expected: u32,
        /// Checksum computed from the bytes read.
        actual: u32,
    },

    /// Page number outside of `0..=1439`.
    #[error("Page number {0} out of range")]
    PageOutOfRange(u32),

    /// Page was requested at or behind the last page already written to the file.
    #[error("Cannot open page {page}: page {last} already written")]
    PastPage {
        /// Requested page number.
        page: u16,
        /// Last page already present in the file.
        last: u16,
    },

    /// Record is older than the position of the write cursor.
    #[error("Past write rejected: record {day} minute {minute} is behind {cursor_day} page {cursor_page}")]
    PastWrite {
        /// Day of the rejected record.
        day: DayKey,
        /// Minute-of-day of the rejected record.
        minute: u16,
        /// Day the cursor (or the newest file of the record's day) is positioned on.
        cursor_day: DayKey,
        /// Page the cursor (or the newest file of the record's day) is positioned on.
        cursor_page: u16,
    },

    /// The file already holds the last page of the day.
    #[error("No pages left in file")]
    NoPagesLeft,

    /// A record was appended before any page was opened.
    #[error("No page selected")]
    PageNotSelected,

    /// Page numbers of two pages or a page and a record do not agree.
    #[error("Page number mismatch: expected {expected}, got {actual}")]
    PageNumberMismatch {
        /// Page number expected by the caller.
        expected: u16,
        /// Page number actually found.
        actual: u16,
    },

    /// Day keys of two files or a file and a record do not agree.
    #[error("File mismatch: expected day {expected}, got {actual}")]
    FileMismatch {
        /// Day of the file.
        expected: DayKey,
        /// Day found on the record or second file.
        actual: DayKey,
    },

    /// Record metadata does not add up to the declared record size.
    #[error("Record size mismatch: declared {declared}, sections sum to {actual}")]
    RecordSizeMismatch {
        /// Size declared in the record metadata.
        declared: u32,
        /// Size computed from the section lengths.
        actual: u64,
    },

    /// Page content does not fill the declared page byte size exactly.
    #[error("Page {page} size mismatch: declared {declared} bytes, consumed {actual}")]
    PageSizeMismatch {
        /// Page number.
        page: u16,
        /// Byte size declared in the page header.
        declared: u64,
        /// Bytes actually consumed by the page's records.
        actual: u64,
    },

    /// Page has already been compressed and sealed.
    #[error("Page {0} is already compressed")]
    AlreadyCompressed(u16),

    /// Compression tag that has no codec in this build.
    #[error("Unsupported compression tag: {0}")]
    UnsupportedCompression(u8),

    /// Error raised by a compression codec.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Label bytes could not be decoded.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// Date fields that do not form a valid calendar day.
    #[error("Invalid day: {year:04}-{month:02}-{day:02}")]
    InvalidDay {
        /// Year field.
        year: u16,
        /// Month field.
        month: u8,
        /// Day-of-month field.
        day: u8,
    },

    /// Record sections exceed the widths of the on-disk length fields.
    #[error("Record too large: {0}")]
    RecordTooLarge(String),

    /// Timestamp that cannot be mapped to a calendar day.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// A WAL file was left in its staging state by an interrupted flush.
    #[error("Dirty WAL file found, manual recovery required: {}", .0.display())]
    DirtyWal(PathBuf),

    /// A file whose contents disagree with its header or name.
    #[error("Corrupted file: {0}")]
    Corrupted(String),

    /// Operation issued after the component was shut down.
    #[error("Component is closed")]
    Closed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
