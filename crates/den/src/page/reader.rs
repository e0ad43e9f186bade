//! Sequential partition file reader.
//!
//! There is no page index: pages are found by walking page headers from the
//! start of the file. A backward [`PageFileReader::select_page`] therefore
//! rewinds, which costs at most one walk over 1440 headers.

use crate::codec::decompress_bytes;
use crate::error::{DenError, Result};
use crate::format::header::{FILE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::format::record::{decode_labels, RECORD_META_SIZE};
use crate::format::{check_page_number, FileHeader, Label, LogRecord, PageHeader, RecordMeta};
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

/// Forward-only reader over the pages of one partition file.
pub struct PageFileReader {
    reader: BufReader<File>,
    path: PathBuf,
    file_len: u64,
    header: Option<FileHeader>,
    /// Offset of the next page header.
    next_offset: u64,
    /// Page number of the page most recently returned by the cursor.
    cursor_page: Option<u16>,
}

impl PageFileReader {
    /// Opens a partition file for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            file_len,
            header: None,
            next_offset: FILE_HEADER_SIZE as u64,
            cursor_page: None,
        })
    }

    /// Path of the file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header, parsing and verifying it on first use.
    pub fn header(&mut self) -> Result<&FileHeader> {
        if self.header.is_none() {
            self.reader.seek(SeekFrom::Start(0))?;
            let header = FileHeader::read_from(&mut self.reader)?;
            self.reader.seek(SeekFrom::Start(self.next_offset))?;
            self.header = Some(header);
        }
        match &self.header {
            Some(header) => Ok(header),
            None => Err(DenError::PageNotSelected),
        }
    }

    /// Moves the cursor back in front of the first page.
    pub fn rewind(&mut self) -> Result<()> {
        self.header()?;
        self.next_offset = FILE_HEADER_SIZE as u64;
        self.cursor_page = None;
        Ok(())
    }

    /// Returns a reader over the first page, or `None` for an empty file.
    pub fn first_page(&mut self) -> Result<Option<PageReader<'_>>> {
        self.rewind()?;
        self.next_page()
    }

    /// Advances the cursor and returns a reader over the next page.
    ///
    /// A page reader left partially consumed does not affect the cursor:
    /// the next call seeks straight to the following page header.
    pub fn next_page(&mut self) -> Result<Option<PageReader<'_>>> {
        match self.next_page_header()? {
            Some(header) => self.page_reader(header).map(Some),
            None => Ok(None),
        }
    }

    /// Returns a reader over page `page`, or `None` if the file has no such page.
    ///
    /// Rewinds to the start of the file when `page` is not ahead of the cursor.
    pub fn select_page(&mut self, page: u16) -> Result<Option<PageReader<'_>>> {
        check_page_number(page as u32)?;
        if self.cursor_page.is_some_and(|current| page <= current) {
            self.rewind()?;
        }
        loop {
            match self.next_page_header()? {
                None => return Ok(None),
                Some(header) if header.page_number == page => {
                    return self.page_reader(header).map(Some);
                }
                Some(header) if header.page_number > page => return Ok(None),
                Some(_) => {}
            }
        }
    }

    /// Walks every page header, returning each with the offset it starts at.
    ///
    /// Leaves the cursor at the end of the file.
    pub fn page_headers(&mut self) -> Result<Vec<(u64, PageHeader)>> {
        self.rewind()?;
        let mut headers = Vec::new();
        loop {
            let offset = self.next_offset;
            match self.next_page_header()? {
                Some(header) => headers.push((offset, header)),
                None => return Ok(headers),
            }
        }
    }

    /// Reads the raw on-disk span of a page located by [`Self::page_headers`].
    pub fn read_raw_page(&mut self, offset: u64, header: &PageHeader) -> Result<Vec<u8>> {
        let start = offset + PAGE_HEADER_SIZE as u64;
        if start + header.byte_size as u64 > self.file_len {
            return Err(DenError::PageSizeMismatch {
                page: header.page_number,
                declared: header.byte_size as u64,
                actual: self.file_len.saturating_sub(start),
            });
        }
        self.reader.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; header.byte_size as usize];
        self.reader.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads every record of the file in page order.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut page = self.first_page()?;
        while let Some(mut current) = page {
            while let Some(record) = current.next_record()? {
                records.push(record);
            }
            current.finish()?;
            page = self.next_page()?;
        }
        Ok(records)
    }

    /// Reads the next page header, stopping at the last page recorded in the
    /// file header. Bytes past that page were never synced and are ignored.
    fn next_page_header(&mut self) -> Result<Option<PageHeader>> {
        let Some(last_page) = self.header()?.last_page else {
            return Ok(None);
        };
        if self.cursor_page == Some(last_page) || self.next_offset >= self.file_len {
            return Ok(None);
        }
        if self.next_offset + PAGE_HEADER_SIZE as u64 > self.file_len {
            return Err(DenError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "truncated page header at offset {} of {}",
                    self.next_offset,
                    self.path.display()
                ),
            )));
        }

        self.reader.seek(SeekFrom::Start(self.next_offset))?;
        let header = PageHeader::read_from(&mut self.reader)?;
        if let Some(previous) = self.cursor_page {
            if header.page_number <= previous {
                return Err(DenError::PageNumberMismatch {
                    expected: previous + 1,
                    actual: header.page_number,
                });
            }
        }
        if header.page_number > last_page {
            return Err(DenError::PageNumberMismatch {
                expected: last_page,
                actual: header.page_number,
            });
        }

        let data_start = self.next_offset + PAGE_HEADER_SIZE as u64;
        let data_end = data_start + header.byte_size as u64;
        if data_end > self.file_len {
            return Err(DenError::PageSizeMismatch {
                page: header.page_number,
                declared: header.byte_size as u64,
                actual: self.file_len - data_start,
            });
        }

        self.next_offset = data_end;
        self.cursor_page = Some(header.page_number);
        Ok(Some(header))
    }

    /// Builds a page reader; the underlying reader sits at the page data.
    fn page_reader(&mut self, header: PageHeader) -> Result<PageReader<'_>> {
        let source = if header.compression.is_compressed() {
            let mut packed = vec![0u8; header.byte_size as usize];
            self.reader.read_exact(&mut packed)?;
            let raw = decompress_bytes(header.compression, &packed, header.raw_size as usize)?;
            if raw.len() != header.raw_size as usize {
                return Err(DenError::PageSizeMismatch {
                    page: header.page_number,
                    declared: header.raw_size as u64,
                    actual: raw.len() as u64,
                });
            }
            PageSource::Decoded(Cursor::new(raw))
        } else {
            PageSource::Raw((&mut self.reader).take(header.byte_size as u64))
        };
        Ok(PageReader::new(header, source))
    }
}

enum PageSource<'a> {
    Raw(Take<&'a mut BufReader<File>>),
    Decoded(Cursor<Vec<u8>>),
}

impl PageSource<'_> {
    fn remaining(&self) -> u64 {
        match self {
            Self::Raw(take) => take.limit(),
            Self::Decoded(cursor) => {
                (cursor.get_ref().len() as u64).saturating_sub(cursor.position())
            }
        }
    }
}

impl Read for PageSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(take) => take.read(buf),
            Self::Decoded(cursor) => cursor.read(buf),
        }
    }
}

/// Reader bounded to the records of a single page.
///
/// Records are materialized section by section: [`PageReader::scan`] reads
/// only the metadata; [`PageReader::labels`] and [`PageReader::message`]
/// load the remaining sections on demand into buffers reused across records.
pub struct PageReader<'a> {
    header: PageHeader,
    source: PageSource<'a>,
    /// Total serialized bytes of the page's records.
    page_len: u64,
    remaining_records: u32,
    meta: Option<RecordMeta>,
    labels_loaded: bool,
    message_loaded: bool,
    labels_buf: Vec<u8>,
    message_buf: Vec<u8>,
}

impl<'a> PageReader<'a> {
    fn new(header: PageHeader, source: PageSource<'a>) -> Self {
        Self {
            page_len: source.remaining(),
            header,
            source,
            remaining_records: header.record_count,
            meta: None,
            labels_loaded: false,
            message_loaded: false,
            labels_buf: Vec::new(),
            message_buf: Vec::new(),
        }
    }

    /// Header of the page.
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// Page number of the page.
    pub fn page_number(&self) -> u16 {
        self.header.page_number
    }

    /// Records not yet scanned.
    pub fn remaining_records(&self) -> u32 {
        self.remaining_records
    }

    /// Advances to the next record and returns its metadata.
    ///
    /// Unread sections of the previous record are skipped. Returns `None`
    /// once every record declared by the page header has been scanned.
    pub fn scan(&mut self) -> Result<Option<RecordMeta>> {
        if let Some(meta) = self.meta.take() {
            self.skip_rest(&meta)?;
        }
        if self.remaining_records == 0 {
            self.check_exhausted()?;
            return Ok(None);
        }

        let mut buf = [0u8; RECORD_META_SIZE];
        self.read_exact(&mut buf)?;
        let meta = RecordMeta::from_bytes(&buf)?;
        let body = meta.record_size as u64 - RECORD_META_SIZE as u64;
        if body > self.source.remaining() {
            return Err(self.size_mismatch());
        }

        self.remaining_records -= 1;
        self.labels_loaded = false;
        self.message_loaded = false;
        self.meta = Some(meta);
        Ok(Some(meta))
    }

    /// Decodes the labels of the record last returned by [`Self::scan`].
    pub fn labels(&mut self) -> Result<Vec<Label>> {
        let meta = self.current_meta()?;
        self.load_labels(&meta)?;
        decode_labels(&self.labels_buf, meta.labels_count)
    }

    /// Returns the message of the record last returned by [`Self::scan`].
    pub fn message(&mut self) -> Result<&[u8]> {
        let meta = self.current_meta()?;
        self.load_labels(&meta)?;
        if !self.message_loaded {
            let mut buf = std::mem::take(&mut self.message_buf);
            buf.resize(meta.message_size as usize, 0);
            let result = self.read_exact(&mut buf);
            self.message_buf = buf;
            result?;
            self.message_loaded = true;
        }
        Ok(&self.message_buf)
    }

    /// Reads the next full record.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let Some(meta) = self.scan()? else {
            return Ok(None);
        };
        let labels = self.labels()?;
        let message = self.message()?.to_vec();
        Ok(Some(LogRecord {
            timestamp: meta.timestamp,
            schema_version: meta.schema_version,
            labels,
            message,
        }))
    }

    /// Reads every remaining record of the page.
    pub fn read_records(&mut self) -> Result<Vec<LogRecord>> {
        let mut records = Vec::with_capacity(self.remaining_records as usize);
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Checks that the page was consumed exactly.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PageSizeMismatch` if records remain unscanned or
    /// bytes remain after the last declared record.
    pub fn finish(mut self) -> Result<()> {
        while self.scan()?.is_some() {}
        Ok(())
    }

    fn current_meta(&self) -> Result<RecordMeta> {
        self.meta.ok_or_else(|| {
            DenError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no record scanned",
            ))
        })
    }

    fn load_labels(&mut self, meta: &RecordMeta) -> Result<()> {
        if !self.labels_loaded {
            let mut buf = std::mem::take(&mut self.labels_buf);
            buf.resize(meta.labels_size as usize, 0);
            let result = self.read_exact(&mut buf);
            self.labels_buf = buf;
            result?;
            self.labels_loaded = true;
        }
        Ok(())
    }

    fn skip_rest(&mut self, meta: &RecordMeta) -> Result<()> {
        let mut skip = 0u64;
        if !self.labels_loaded {
            skip += meta.labels_size as u64;
        }
        if !self.message_loaded {
            skip += meta.message_size as u64;
        }
        if skip == 0 {
            return Ok(());
        }
        let copied = io::copy(&mut (&mut self.source).take(skip), &mut io::sink())?;
        if copied != skip {
            return Err(self.size_mismatch());
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.source.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(self.size_mismatch()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_exhausted(&self) -> Result<()> {
        if self.source.remaining() != 0 {
            return Err(self.size_mismatch());
        }
        Ok(())
    }

    fn size_mismatch(&self) -> DenError {
        DenError::PageSizeMismatch {
            page: self.header.page_number,
            declared: self.page_len,
            actual: self.page_len - self.source.remaining(),
        }
    }
}
