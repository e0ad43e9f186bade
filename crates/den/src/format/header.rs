//! File and page headers.

use super::{additive_checksum, check_page_number, le_u16, le_u32, le_u64, DayKey};
use crate::codec::CompressionType;
use crate::error::{DenError, Result};
use std::io::{Read, Write};

/// Magic bytes for the partition file header: "ADNF".
pub const FILE_MAGIC: [u8; 4] = *b"ADNF";

/// Current partition file format version.
pub const FILE_VERSION: u16 = 1;

/// File header size in bytes.
pub const FILE_HEADER_SIZE: usize = 64;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Sentinel stored in the first/last page fields of a file without pages.
pub const NO_PAGE: u16 = u16::MAX;

/// Offset of the checksum field; the checksum covers every byte before it.
const CHECKSUM_OFFSET: usize = FILE_HEADER_SIZE - 4;

/// Partition file header (64 bytes).
///
/// The header is rewritten in place whenever the file is synced, so
/// `first_page`, `last_page` and `record_count` always describe the pages
/// that precede the write position at the time of the last sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File format version.
    pub version: u16,
    /// Calendar day the file partitions.
    pub day: DayKey,
    /// First page written to the file.
    pub first_page: Option<u16>,
    /// Last page written to the file.
    pub last_page: Option<u16>,
    /// Store-unique file identifier.
    pub file_id: u64,
    /// Total number of records across all pages.
    pub record_count: u64,
}

impl FileHeader {
    /// Creates an empty header for a new file.
    pub fn new(day: DayKey, file_id: u64) -> Self {
        Self {
            version: FILE_VERSION,
            day,
            first_page: None,
            last_page: None,
            file_id,
            record_count: 0,
        }
    }

    /// Returns true if no page has been written yet.
    pub fn is_empty(&self) -> bool {
        self.last_page.is_none()
    }

    /// Inclusive page range covered by the file.
    pub fn page_range(&self) -> Option<(u16, u16)> {
        Some((self.first_page?, self.last_page?))
    }

    /// Records that `page` was opened, keeping `first <= last`.
    pub fn note_page(&mut self, page: u16) {
        if self.first_page.is_none() {
            self.first_page = Some(page);
        }
        self.last_page = Some(page);
    }

    /// Serializes the header, computing the checksum.
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        // Magic (4 bytes)
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        // Version (2 bytes)
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // Day key (2 + 1 + 1 bytes)
        buf[6..8].copy_from_slice(&self.day.year().to_le_bytes());
        buf[8] = self.day.month();
        buf[9] = self.day.day();
        // First / last page (2 + 2 bytes)
        buf[10..12].copy_from_slice(&self.first_page.unwrap_or(NO_PAGE).to_le_bytes());
        buf[12..14].copy_from_slice(&self.last_page.unwrap_or(NO_PAGE).to_le_bytes());
        // Reserved (2 bytes)
        // File id (8 bytes)
        buf[16..24].copy_from_slice(&self.file_id.to_le_bytes());
        // Record count (8 bytes)
        buf[24..32].copy_from_slice(&self.record_count.to_le_bytes());
        // Reserved padding (28 bytes)
        // Checksum (4 bytes)
        let checksum = additive_checksum(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parses and verifies a serialized header.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidMagic`, `DenError::UnsupportedVersion` or
    /// `DenError::ChecksumMismatch` for damaged headers, and
    /// `DenError::PageOutOfRange` if the page fields are inconsistent.
    pub fn from_bytes(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != FILE_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }

        let expected = le_u32(buf, CHECKSUM_OFFSET);
        let actual = additive_checksum(&buf[..CHECKSUM_OFFSET]);
        if expected != actual {
            return Err(DenError::ChecksumMismatch { expected, actual });
        }

        let version = le_u16(buf, 4);
        if version > FILE_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }

        let day = DayKey::new(le_u16(buf, 6), buf[8], buf[9])?;
        let first_page = decode_page_field(le_u16(buf, 10))?;
        let last_page = decode_page_field(le_u16(buf, 12))?;
        match (first_page, last_page) {
            (Some(first), Some(last)) if first > last => {
                return Err(DenError::PageNumberMismatch {
                    expected: first,
                    actual: last,
                });
            }
            (Some(page), None) | (None, Some(page)) => {
                return Err(DenError::PageOutOfRange(page as u32));
            }
            _ => {}
        }

        Ok(Self {
            version,
            day,
            first_page,
            last_page,
            file_id: le_u64(buf, 16),
            record_count: le_u64(buf, 24),
        })
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads and verifies a header from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

fn decode_page_field(raw: u16) -> Result<Option<u16>> {
    if raw == NO_PAGE {
        return Ok(None);
    }
    check_page_number(raw as u32).map(Some)
}

/// Page header (16 bytes) preceding each page span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page number (minute of day).
    pub page_number: u16,
    /// Compression applied to the page span.
    pub compression: CompressionType,
    /// Byte length of the page span on disk.
    pub byte_size: u32,
    /// Number of records in the page.
    pub record_count: u32,
    /// Serialized length of the records before compression.
    pub raw_size: u32,
}

impl PageHeader {
    /// Creates an empty uncompressed page header.
    pub fn new(page_number: u16) -> Self {
        Self {
            page_number,
            compression: CompressionType::None,
            byte_size: 0,
            record_count: 0,
            raw_size: 0,
        }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        // Page number (2 bytes)
        buf[0..2].copy_from_slice(&self.page_number.to_le_bytes());
        // Compression tag (1 byte), reserved (1 byte)
        buf[2] = self.compression.as_u8();
        // Byte size (4 bytes)
        buf[4..8].copy_from_slice(&self.byte_size.to_le_bytes());
        // Record count (4 bytes)
        buf[8..12].copy_from_slice(&self.record_count.to_le_bytes());
        // Raw size (4 bytes)
        buf[12..16].copy_from_slice(&self.raw_size.to_le_bytes());
        buf
    }

    /// Parses a serialized header.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PageOutOfRange` for page numbers past 1439 and
    /// `DenError::UnsupportedCompression` for unknown tags.
    pub fn from_bytes(buf: &[u8; PAGE_HEADER_SIZE]) -> Result<Self> {
        let page_number = check_page_number(le_u16(buf, 0) as u32)?;
        let compression =
            CompressionType::from_u8(buf[2]).ok_or(DenError::UnsupportedCompression(buf[2]))?;
        Ok(Self {
            page_number,
            compression,
            byte_size: le_u32(buf, 4),
            record_count: le_u32(buf, 8),
            raw_size: le_u32(buf, 12),
        })
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads a header from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}
