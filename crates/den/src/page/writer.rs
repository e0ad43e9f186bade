//! Append-only partition file writer.
//!
//! Page headers are written twice: a placeholder when the page is opened,
//! and the final version (size, count, compression) when the page is closed
//! or the file is synced. The file header is rewritten on every sync.

use crate::codec::compress_bytes;
use crate::config::WriterConfig;
use crate::error::{DenError, Result};
use crate::format::header::{FILE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::format::{check_page_number, DayKey, FileHeader, LogRecord, PageHeader, MAX_PAGE_NUMBER};
use crate::page::PageFileReader;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Page currently accepting records.
#[derive(Debug, Clone, Copy)]
struct OpenPage {
    header: PageHeader,
    /// File offset of the page header.
    offset: u64,
    /// Page is compressed when sealed.
    compress: bool,
    /// Page span is final and accepts no more records.
    sealed: bool,
}

/// Writer appending pages and records to one partition file.
pub struct PageFileWriter {
    file: File,
    path: PathBuf,
    config: WriterConfig,
    header: FileHeader,
    page: Option<OpenPage>,
    /// Bytes staged for `end_offset`.
    buffer: Vec<u8>,
    /// File offset where the staging buffer will land.
    end_offset: u64,
    dirty: bool,
    finished: bool,
}

impl PageFileWriter {
    /// Creates a new partition file and writes its empty header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created, or
    /// if the configured compression has no codec.
    pub fn create(path: &Path, day: DayKey, file_id: u64, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = FileHeader::new(day, file_id);
        file.write_all(&header.to_bytes())?;
        debug!("Created partition file {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            buffer: Vec::with_capacity(config.buffer_threshold),
            config,
            header,
            page: None,
            end_offset: FILE_HEADER_SIZE as u64,
            dirty: true,
            finished: false,
        })
    }

    /// Reopens an existing partition file for appending.
    ///
    /// The last page is resumed unless it is compressed. Bytes past the last
    /// synced page (left by an interrupted write) are truncated, and the
    /// record count is recomputed from the page headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the file header or page chain is damaged.
    pub fn open(path: &Path, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let mut reader = PageFileReader::open(path)?;
        let mut header = reader.header()?.clone();
        let pages = reader.page_headers()?;
        drop(reader);

        let last = pages.last().copied();
        let last_number = last.map(|(_, page)| page.page_number);
        if last_number != header.last_page {
            return Err(DenError::PageNumberMismatch {
                expected: header.last_page.unwrap_or(u16::MAX),
                actual: last_number.unwrap_or(u16::MAX),
            });
        }

        let record_count: u64 = pages.iter().map(|(_, page)| page.record_count as u64).sum();
        if record_count != header.record_count {
            warn!(
                "Partition file {} header counts {} records, pages hold {}",
                path.display(),
                header.record_count,
                record_count
            );
            header.record_count = record_count;
        }
        header.first_page = pages.first().map(|(_, page)| page.page_number);

        let end_offset = match last {
            Some((offset, page)) => offset + PAGE_HEADER_SIZE as u64 + page.byte_size as u64,
            None => FILE_HEADER_SIZE as u64,
        };

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len > end_offset {
            warn!(
                "Truncating {} unsynced bytes from {}",
                file_len - end_offset,
                path.display()
            );
            file.set_len(end_offset)?;
        }

        let page = last.map(|(offset, page)| OpenPage {
            header: page,
            offset,
            compress: false,
            sealed: page.compression.is_compressed(),
        });

        Ok(Self {
            file,
            path: path.to_path_buf(),
            buffer: Vec::with_capacity(config.buffer_threshold),
            config,
            header,
            page,
            end_offset,
            dirty: false,
            finished: false,
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File header as of the last change.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Day the file partitions.
    pub fn day(&self) -> DayKey {
        self.header.day
    }

    /// Writer configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Page currently accepting records.
    pub fn current_page(&self) -> Option<u16> {
        self.page.map(|page| page.header.page_number)
    }

    /// Header of the current page as of the last change.
    pub fn current_page_header(&self) -> Option<PageHeader> {
        self.page.map(|page| page.header)
    }

    /// Closes the current page and opens page `page_number`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PageOutOfRange` past minute 1439,
    /// `DenError::NoPagesLeft` if page 1439 is already written, and
    /// `DenError::PastPage` if `page_number` is not after the last page.
    pub fn append_page(&mut self, page_number: u16) -> Result<()> {
        self.check_next_page(page_number)?;
        self.close_page()?;

        let offset = self.end_offset + self.buffer.len() as u64;
        self.buffer
            .extend_from_slice(&PageHeader::new(page_number).to_bytes());
        let compress = self.config.compression.is_compressed();
        if compress {
            // compressed spans are built from the staging buffer alone
            self.flush_buffer()?;
        }

        self.page = Some(OpenPage {
            header: PageHeader::new(page_number),
            offset,
            compress,
            sealed: false,
        });
        self.header.note_page(page_number);
        self.dirty = true;
        debug!("Opened page {} in {}", page_number, self.path.display());
        Ok(())
    }

    /// Appends a record to the current page.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PageNotSelected` if no page is open,
    /// `DenError::AlreadyCompressed` if the page is sealed,
    /// `DenError::FileMismatch` / `DenError::PageNumberMismatch` if the
    /// record's day or minute does not belong to this file and page.
    pub fn append_record(&mut self, record: &LogRecord) -> Result<()> {
        let page = self.page.as_ref().ok_or(DenError::PageNotSelected)?;
        let page_number = page.header.page_number;
        if page.sealed {
            return Err(DenError::AlreadyCompressed(page_number));
        }
        let day = record.day()?;
        if day != self.header.day {
            return Err(DenError::FileMismatch {
                expected: self.header.day,
                actual: day,
            });
        }
        if record.minute() != page_number {
            return Err(DenError::PageNumberMismatch {
                expected: page_number,
                actual: record.minute(),
            });
        }

        let start = self.buffer.len();
        let size = match record.encode_into(&mut self.buffer) {
            Ok(size) => size,
            Err(e) => {
                self.buffer.truncate(start);
                return Err(e);
            }
        };
        self.account_record(size)?;

        if self.buffer.len() >= self.config.buffer_threshold && !self.compressing() {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Appends an already-serialized page verbatim.
    ///
    /// The page is closed immediately; compressed pages are sealed.
    ///
    /// # Errors
    ///
    /// Same ordering rules as [`Self::append_page`]; returns
    /// `DenError::PageSizeMismatch` if `span` does not match the header.
    pub fn append_raw_page(&mut self, header: PageHeader, span: &[u8]) -> Result<()> {
        if span.len() as u64 != header.byte_size as u64 {
            return Err(DenError::PageSizeMismatch {
                page: header.page_number,
                declared: header.byte_size as u64,
                actual: span.len() as u64,
            });
        }
        self.check_next_page(header.page_number)?;
        self.close_page()?;

        let offset = self.end_offset + self.buffer.len() as u64;
        self.buffer.extend_from_slice(&header.to_bytes());
        self.buffer.extend_from_slice(span);
        self.page = Some(OpenPage {
            header,
            offset,
            compress: false,
            sealed: header.compression.is_compressed(),
        });
        self.header.note_page(header.page_number);
        self.header.record_count += header.record_count as u64;
        self.dirty = true;

        if self.buffer.len() >= self.config.buffer_threshold {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Completes the current page: seals it if compressing, flushes its bytes
    /// and rewrites its header. Returns the final page header.
    ///
    /// Records can still be appended to an uncompressed page afterwards.
    pub fn finish_page(&mut self) -> Result<Option<PageHeader>> {
        self.close_page()?;
        Ok(self.current_page_header())
    }

    /// Flushes staged data, rewrites the current page header and the file
    /// header, and syncs according to the configured [`SyncMode`].
    ///
    /// A page being compressed is sealed by this call.
    ///
    /// [`SyncMode`]: crate::config::SyncMode
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.seal_page()?;
        self.flush_buffer()?;
        self.write_page_header()?;
        self.write_file_header()?;
        self.config.sync_mode.apply(&self.file)?;
        self.dirty = false;
        Ok(())
    }

    /// Syncs and closes the file, returning the final header.
    pub fn close(mut self) -> Result<FileHeader> {
        self.sync()?;
        self.finished = true;
        debug!(
            "Closed partition file {} ({} records)",
            self.path.display(),
            self.header.record_count
        );
        Ok(self.header.clone())
    }

    fn check_next_page(&self, page_number: u16) -> Result<()> {
        check_page_number(page_number as u32)?;
        if let Some(last) = self.header.last_page {
            if last == MAX_PAGE_NUMBER {
                return Err(DenError::NoPagesLeft);
            }
            if page_number <= last {
                return Err(DenError::PastPage {
                    page: page_number,
                    last,
                });
            }
        }
        Ok(())
    }

    fn compressing(&self) -> bool {
        self.page.is_some_and(|page| page.compress && !page.sealed)
    }

    fn account_record(&mut self, size: u32) -> Result<()> {
        let compressing = self.compressing();
        let Some(page) = self.page.as_mut() else {
            return Err(DenError::PageNotSelected);
        };
        let page_number = page.header.page_number;
        let overflow = || DenError::RecordTooLarge(format!("page {page_number}"));
        page.header.raw_size = page.header.raw_size.checked_add(size).ok_or_else(overflow)?;
        if !compressing {
            page.header.byte_size = page.header.raw_size;
        }
        page.header.record_count += 1;
        self.header.record_count += 1;
        self.dirty = true;
        Ok(())
    }

    /// Closes the current page so the next one can start.
    fn close_page(&mut self) -> Result<()> {
        if self.page.is_none() {
            return Ok(());
        }
        self.seal_page()?;
        self.flush_buffer()?;
        self.write_page_header()
    }

    /// Compresses the staged records of a compressing page.
    fn seal_page(&mut self) -> Result<()> {
        let Some(page) = self.page.as_mut() else {
            return Ok(());
        };
        if !page.compress || page.sealed {
            return Ok(());
        }
        let kind = self.config.compression;
        let packed = compress_bytes(kind, &self.buffer)?;
        page.header.compression = kind;
        page.header.byte_size = u32::try_from(packed.len())
            .map_err(|_| DenError::RecordTooLarge(format!("page {}", page.header.page_number)))?;
        page.sealed = true;
        debug!(
            "Sealed page {}: {} -> {} bytes ({:?})",
            page.header.page_number,
            page.header.raw_size,
            page.header.byte_size,
            kind
        );
        self.buffer = packed;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&self.buffer)?;
        self.end_offset += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn write_page_header(&mut self) -> Result<()> {
        if let Some(page) = self.page {
            self.file.seek(SeekFrom::Start(page.offset))?;
            self.file.write_all(&page.header.to_bytes())?;
        }
        Ok(())
    }

    fn write_file_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }
}

impl Drop for PageFileWriter {
    fn drop(&mut self) {
        if self.finished || !self.dirty {
            return;
        }
        if let Err(e) = self.sync() {
            warn!(
                "Failed to sync partition file {} on drop: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionType;
    use crate::config::SyncMode;
    use crate::format::header::NO_PAGE;
    use tempfile::TempDir;

    const DAY_START: i64 = 1_704_067_200; // 2024-01-01

    fn day() -> DayKey {
        DayKey::new(2024, 1, 1).unwrap()
    }

    fn config() -> WriterConfig {
        WriterConfig::default().with_sync_mode(SyncMode::None)
    }

    fn record(minute: u16, second: i64) -> LogRecord {
        LogRecord::new(DAY_START + minute as i64 * 60 + second, 1)
            .with_label("service", "api")
            .with_message(format!("minute {minute} second {second}"))
    }

    fn new_writer(dir: &TempDir, config: WriterConfig) -> PageFileWriter {
        let path = dir.path().join("2024-01-01.1.den");
        PageFileWriter::create(&path, day(), 1, config).unwrap()
    }

    #[test]
    fn test_create_writes_empty_header() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, config());
        let path = writer.path().to_path_buf();
        let header = writer.close().unwrap();
        assert!(header.is_empty());

        let mut reader = PageFileReader::open(&path).unwrap();
        assert_eq!(reader.header().unwrap(), &header);
        assert!(reader.first_page().unwrap().is_none());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, config());
        let path = writer.path().to_path_buf();
        writer.close().unwrap();
        assert!(PageFileWriter::create(&path, day(), 1, config()).is_err());
    }

    #[test]
    fn test_create_rejects_unsupported_compression() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2024-01-01.1.den");
        let snappy = config().with_compression(CompressionType::Snappy);
        assert!(matches!(
            PageFileWriter::create(&path, day(), 1, snappy),
            Err(DenError::UnsupportedCompression(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_append_page_rejects_past_pages() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(10).unwrap();
        assert!(matches!(
            writer.append_page(10),
            Err(DenError::PastPage { page: 10, last: 10 })
        ));
        assert!(matches!(
            writer.append_page(3),
            Err(DenError::PastPage { page: 3, last: 10 })
        ));
        writer.append_page(11).unwrap();
        assert_eq!(writer.current_page(), Some(11));
    }

    #[test]
    fn test_append_page_range_and_exhaustion() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        assert!(matches!(
            writer.append_page(1440),
            Err(DenError::PageOutOfRange(1440))
        ));
        writer.append_page(1439).unwrap();
        assert!(matches!(writer.append_page(1439), Err(DenError::NoPagesLeft)));
    }

    #[test]
    fn test_append_record_requires_page() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        assert!(matches!(
            writer.append_record(&record(0, 0)),
            Err(DenError::PageNotSelected)
        ));
    }

    #[test]
    fn test_append_record_checks_page_and_day() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(5).unwrap();
        assert!(matches!(
            writer.append_record(&record(6, 0)),
            Err(DenError::PageNumberMismatch { expected: 5, actual: 6 })
        ));
        let next_day = LogRecord::new(DAY_START + 86_400 + 5 * 60, 1);
        assert!(matches!(
            writer.append_record(&next_day),
            Err(DenError::FileMismatch { .. })
        ));
    }

    #[test]
    fn test_page_sizes_match_records() {
        let dir = TempDir::new().unwrap();
        // tiny threshold forces auto flushes mid-page
        let mut writer = new_writer(&dir, config().with_buffer_threshold(32));
        let mut expected = Vec::new();
        for minute in [0u16, 1, 2] {
            writer.append_page(minute).unwrap();
            let mut size = 0;
            for second in 0..5 {
                let r = record(minute, second);
                size += r.encoded_len() as u32;
                writer.append_record(&r).unwrap();
            }
            expected.push((minute, size));
        }
        let path = writer.path().to_path_buf();
        let header = writer.close().unwrap();
        assert_eq!(header.page_range(), Some((0, 2)));
        assert_eq!(header.record_count, 15);

        let mut reader = PageFileReader::open(&path).unwrap();
        let pages: Vec<_> = reader
            .page_headers()
            .unwrap()
            .into_iter()
            .map(|(_, h)| (h.page_number, h.byte_size))
            .collect();
        assert_eq!(pages, expected);
        assert_eq!(reader.read_all().unwrap().len(), 15);
    }

    #[test]
    fn test_sync_keeps_file_readable_mid_page() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(42).unwrap();
        writer.append_record(&record(42, 0)).unwrap();
        writer.sync().unwrap();

        let mut reader = PageFileReader::open(writer.path()).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 1);

        writer.append_record(&record(42, 1)).unwrap();
        writer.sync().unwrap();
        let mut reader = PageFileReader::open(writer.path()).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 2);
        assert_eq!(reader.header().unwrap().record_count, 2);
    }

    #[test]
    fn test_open_resumes_last_page() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(7).unwrap();
        writer.append_record(&record(7, 0)).unwrap();
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        let mut writer = PageFileWriter::open(&path, config()).unwrap();
        assert_eq!(writer.current_page(), Some(7));
        writer.append_record(&record(7, 30)).unwrap();
        writer.append_page(8).unwrap();
        writer.append_record(&record(8, 0)).unwrap();
        let header = writer.close().unwrap();
        assert_eq!(header.page_range(), Some((7, 8)));
        assert_eq!(header.record_count, 3);

        let mut reader = PageFileReader::open(&path).unwrap();
        let mut page = reader.select_page(7).unwrap().unwrap();
        assert_eq!(page.read_records().unwrap().len(), 2);
    }

    #[test]
    fn test_open_truncates_unsynced_tail() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(1).unwrap();
        writer.append_record(&record(1, 0)).unwrap();
        let path = writer.path().to_path_buf();
        writer.close().unwrap();
        let synced_len = std::fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"half a record").unwrap();
        drop(file);

        let writer = PageFileWriter::open(&path, config()).unwrap();
        drop(writer);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), synced_len);
    }

    #[test]
    fn test_compressed_pages_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config().with_compression(CompressionType::Zstd));
        for minute in [100u16, 200] {
            writer.append_page(minute).unwrap();
            for second in 0..20 {
                writer.append_record(&record(minute, second)).unwrap();
            }
        }
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        let mut reader = PageFileReader::open(&path).unwrap();
        let headers = reader.page_headers().unwrap();
        for (_, header) in &headers {
            assert_eq!(header.compression, CompressionType::Zstd);
            assert!(header.byte_size < header.raw_size);
        }
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 40);
        assert_eq!(records[0], record(100, 0));
    }

    #[test]
    fn test_sealed_page_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config().with_compression(CompressionType::Gzip));
        writer.append_page(3).unwrap();
        writer.append_record(&record(3, 0)).unwrap();
        writer.sync().unwrap();
        assert!(matches!(
            writer.append_record(&record(3, 1)),
            Err(DenError::AlreadyCompressed(3))
        ));
        writer.append_page(4).unwrap();
        writer.append_record(&record(4, 0)).unwrap();
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        let mut writer = PageFileWriter::open(&path, config()).unwrap();
        assert!(matches!(
            writer.append_record(&record(4, 1)),
            Err(DenError::AlreadyCompressed(4))
        ));
    }

    #[test]
    fn test_append_raw_page_copies_span() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(9).unwrap();
        writer.append_record(&record(9, 0)).unwrap();
        let source = writer.path().to_path_buf();
        writer.close().unwrap();

        let mut reader = PageFileReader::open(&source).unwrap();
        let (offset, header) = reader.page_headers().unwrap()[0];
        let span = reader.read_raw_page(offset, &header).unwrap();

        let target = dir.path().join("2024-01-01.2.den");
        let mut copy = PageFileWriter::create(&target, day(), 2, config()).unwrap();
        copy.append_raw_page(header, &span).unwrap();
        assert!(matches!(
            copy.append_raw_page(header, &span),
            Err(DenError::PastPage { .. })
        ));
        let copied = copy.close().unwrap();
        assert_eq!(copied.record_count, 1);

        let mut reader = PageFileReader::open(&target).unwrap();
        assert_eq!(reader.read_all().unwrap(), vec![record(9, 0)]);
    }

    #[test]
    fn test_drop_syncs_headers() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir, config());
        writer.append_page(0).unwrap();
        writer.append_record(&record(0, 0)).unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        let mut reader = PageFileReader::open(&path).unwrap();
        let header = reader.header().unwrap().clone();
        assert_eq!(header.record_count, 1);
        assert_ne!(header.first_page, Some(NO_PAGE));
        assert_eq!(reader.read_all().unwrap().len(), 1);
    }
}
