//! Pending-list WAL: records are kept in memory and flushed to a dedicated
//! WAL file when a size, count, or time threshold trips.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (40 bytes)                            │
//! │  magic "ADWL" | version u16 | reserved u16   │
//! │  created_at i64 | record_count u32 | pad u32 │
//! │  first_seq u64 | last_seq u64                │
//! ├──────────────────────────────────────────────┤
//! │ Entry: len u32 | crc32 u32 | seq u64 record  │
//! │ ... record_count entries                     │
//! └──────────────────────────────────────────────┘
//! ```

use super::{commit_staged, discard_staged, wal_paths, DurableBuffer, FileStamp, ReleaseLedger};
use crate::config::PendingLogConfig;
use crate::error::{DenError, Result};
use crate::format::{le_i64, le_u16, le_u32, le_u64, LogRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, warn};

/// WAL file magic bytes.
pub const WAL_MAGIC: [u8; 4] = *b"ADWL";

/// WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Size of the WAL file header.
pub const WAL_HEADER_SIZE: usize = 40;

/// Per-entry framing overhead: length, checksum and sequence number.
const ENTRY_OVERHEAD: usize = 4 + 4 + 8;

/// Header of a pending-list WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFileHeader {
    /// Format version.
    pub version: u16,
    /// Creation time in unix nanoseconds (also the file name).
    pub created_at: i64,
    /// Number of entries.
    pub record_count: u32,
    /// Sequence of the first entry.
    pub first_seq: u64,
    /// Sequence of the last entry.
    pub last_seq: u64,
}

impl WalFileHeader {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // 6..8 reserved
        buf[8..16].copy_from_slice(&self.created_at.to_le_bytes());
        buf[16..20].copy_from_slice(&self.record_count.to_le_bytes());
        // 20..24 reserved
        buf[24..32].copy_from_slice(&self.first_seq.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_seq.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn from_bytes(buf: &[u8; WAL_HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != WAL_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        let version = le_u16(buf, 4);
        if version != WAL_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            created_at: le_i64(buf, 8),
            record_count: le_u32(buf, 16),
            first_seq: le_u64(buf, 24),
            last_seq: le_u64(buf, 32),
        })
    }
}

/// Decoded contents of a WAL file.
#[derive(Debug, Clone)]
pub struct WalFile {
    /// File header.
    pub header: WalFileHeader,
    /// Entries in write order.
    pub entries: Vec<(u64, LogRecord)>,
}

/// Reads and verifies a pending-list WAL file.
///
/// Every entry checksum is verified and the entry count must match the header.
pub fn read_wal_file(path: &Path) -> Result<WalFile> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut buf = [0u8; WAL_HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    let header = WalFileHeader::from_bytes(&buf)?;

    let mut entries = Vec::with_capacity(header.record_count as usize);
    while let Some(entry) = read_entry(&mut reader)? {
        entries.push(entry);
    }

    if entries.len() != header.record_count as usize {
        return Err(DenError::Corrupted(format!(
            "{}: header declares {} entries, found {}",
            path.display(),
            header.record_count,
            entries.len()
        )));
    }
    Ok(WalFile { header, entries })
}

/// Reads a single entry; `None` at a clean end of file.
fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(u64, LogRecord)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < 8 {
        return Err(DenError::Corrupted(format!("entry length {} too short", len)));
    }

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let expected = u32::from_le_bytes(crc_buf);

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    let actual = crc32fast::hash(&data);
    if actual != expected {
        return Err(DenError::ChecksumMismatch { expected, actual });
    }

    let seq = le_u64(&data, 0);
    let record = LogRecord::decode(&data[8..])?;
    Ok(Some((seq, record)))
}

/// Appends one framed entry to `buf`.
fn encode_entry(buf: &mut Vec<u8>, seq: u64, record: &LogRecord) -> Result<()> {
    let mut payload = Vec::with_capacity(8 + record.encoded_len());
    payload.extend_from_slice(&seq.to_le_bytes());
    record.encode_into(&mut payload)?;

    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Pending-list durability buffer.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::wal::{DurableBuffer, PendingLog};
///
/// let mut wal = PendingLog::new(dir, PendingLogConfig::default())?;
/// wal.append(1, &record)?;
/// wal.flush(true)?;
/// wal.release(1)?;
/// ```
#[derive(Debug)]
pub struct PendingLog {
    dir: PathBuf,
    config: PendingLogConfig,
    pending: Vec<(u64, LogRecord)>,
    pending_bytes: usize,
    last_flush: Instant,
    stamp: FileStamp,
    ledger: ReleaseLedger,
}

impl PendingLog {
    /// Creates a pending-list WAL writing into `dir`.
    pub fn new(dir: &Path, config: PendingLogConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            pending: Vec::new(),
            pending_bytes: 0,
            last_flush: Instant::now(),
            stamp: FileStamp::default(),
            ledger: ReleaseLedger::new(dir),
        })
    }

    /// Bytes buffered in memory.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn thresholds_tripped(&self) -> bool {
        self.pending_bytes >= self.config.max_bytes
            || self.pending.len() >= self.config.max_records
    }

    fn write_pending(&mut self) -> Result<()> {
        let records = std::mem::take(&mut self.pending);
        let bytes = std::mem::replace(&mut self.pending_bytes, 0);
        let created_at = self.stamp.next();
        let (path, dirty) = wal_paths(&self.dir, created_at);

        match self.write_file(&records, created_at, &path, &dirty) {
            Ok(max_seq) => {
                self.ledger.record(path.clone(), max_seq);
                self.last_flush = Instant::now();
                debug!(
                    "Flushed {} WAL records ({} bytes) to {}",
                    records.len(),
                    bytes,
                    path.display()
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to flush {} WAL records: {}", records.len(), e);
                discard_staged(&dirty);
                self.pending = records;
                self.pending_bytes = bytes;
                Err(e)
            }
        }
    }

    fn write_file(
        &self,
        records: &[(u64, LogRecord)],
        created_at: i64,
        path: &Path,
        dirty: &Path,
    ) -> Result<u64> {
        let first_seq = records.first().map_or(0, |(seq, _)| *seq);
        let last_seq = records.last().map_or(0, |(seq, _)| *seq);
        let max_seq = records.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
        let record_count = u32::try_from(records.len())
            .map_err(|_| DenError::RecordTooLarge(format!("{} WAL entries", records.len())))?;

        let header = WalFileHeader {
            version: WAL_VERSION,
            created_at,
            record_count,
            first_seq,
            last_seq,
        };

        let file = OpenOptions::new().write(true).create_new(true).open(dirty)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header.to_bytes())?;

        let mut buf = Vec::new();
        for (seq, record) in records {
            buf.clear();
            encode_entry(&mut buf, *seq, record)?;
            writer.write_all(&buf)?;
        }
        writer.flush()?;
        self.config.sync_mode.apply(writer.get_ref())?;
        drop(writer);

        commit_staged(dirty, path, self.config.sync_mode)?;
        Ok(max_seq)
    }
}

impl DurableBuffer for PendingLog {
    fn append(&mut self, seq: u64, record: &LogRecord) -> Result<()> {
        let size = ENTRY_OVERHEAD + record.encoded_len();
        self.pending_bytes += size;
        self.pending.push((seq, record.clone()));
        if self.thresholds_tripped() {
            if let Err(e) = self.write_pending() {
                // The caller sees the failure, so the record must not be retried.
                self.pending.pop();
                self.pending_bytes -= size;
                return Err(e);
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.flush(false)
    }

    fn flush(&mut self, force: bool) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let due = self.last_flush.elapsed() >= self.config.flush_interval;
        if force || due || self.thresholds_tripped() {
            self.write_pending()?;
        }
        Ok(())
    }

    fn release(&mut self, up_to_seq: u64) -> Result<usize> {
        self.ledger.release(up_to_seq, self.config.sync_mode)
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn live_files(&self) -> usize {
        self.ledger.len()
    }
}

impl Drop for PendingLog {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            if let Err(e) = self.write_pending() {
                warn!("Failed to flush pending WAL records on drop: {}", e);
            }
        }
    }
}
