//! Den binary format.
//!
//! Every structure persisted by Den shares the fixed little-endian layouts
//! defined here:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (64 bytes)                                      │
//! │  - Magic "ADNF", version, day key, first/last page,          │
//! │    file id, record count, additive checksum                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Page Header (16 bytes)                                      │
//! │  - Page number (minute of day), compression tag,             │
//! │    byte size, record count, raw size                         │
//! │  Page span                                                   │
//! │  - Record Metadata (24 bytes) + labels + message, repeated   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ... further (Page Header, page span) pairs, ascending       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pages are keyed by minute of day, files by UTC calendar day.

pub mod header;
pub mod record;

pub use header::{FileHeader, PageHeader};
pub use record::{Label, LabelValue, LogRecord, RecordMeta};

use crate::error::{DenError, Result};
use chrono::{Datelike, NaiveDate};
use std::fmt;

/// Seconds in one calendar day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Number of pages (minutes) in one partition file.
pub const PAGES_PER_FILE: u16 = 1440;

/// Highest valid page number.
pub const MAX_PAGE_NUMBER: u16 = PAGES_PER_FILE - 1;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Returns the minute-of-day (page number) of a unix timestamp in seconds.
pub fn minute_of_day(timestamp: i64) -> u16 {
    (timestamp.rem_euclid(SECONDS_PER_DAY) / 60) as u16
}

/// Validates a page number, returning it as `u16`.
pub fn check_page_number(page: u32) -> Result<u16> {
    if page > MAX_PAGE_NUMBER as u32 {
        return Err(DenError::PageOutOfRange(page));
    }
    Ok(page as u16)
}

/// UTC calendar day identifying a partition file.
///
/// Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(NaiveDate);

impl DayKey {
    /// Creates a day key from calendar fields.
    pub fn new(year: u16, month: u8, day: u8) -> Result<Self> {
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            .map(Self)
            .ok_or(DenError::InvalidDay { year, month, day })
    }

    /// Returns the UTC day a unix timestamp (seconds) falls on.
    pub fn from_timestamp(timestamp: i64) -> Result<Self> {
        let days = timestamp.div_euclid(SECONDS_PER_DAY) + UNIX_EPOCH_DAYS_FROM_CE;
        let date = i32::try_from(days)
            .ok()
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or(DenError::InvalidTimestamp(timestamp))?;
        if !(0..=u16::MAX as i32).contains(&date.year()) {
            return Err(DenError::InvalidTimestamp(timestamp));
        }
        Ok(Self(date))
    }

    /// Year field.
    pub fn year(&self) -> u16 {
        self.0.year() as u16
    }

    /// Month field (1-12).
    pub fn month(&self) -> u8 {
        self.0.month() as u8
    }

    /// Day-of-month field (1-31).
    pub fn day(&self) -> u8 {
        self.0.day() as u8
    }

    /// Unix timestamp of the first second of this day.
    pub fn start_timestamp(&self) -> i64 {
        (self.0.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE) * SECONDS_PER_DAY
    }

    /// Unix timestamp of the first second of the next day (exclusive end).
    pub fn end_timestamp(&self) -> i64 {
        self.start_timestamp() + SECONDS_PER_DAY
    }

    /// Unix timestamp of the first second of `page` within this day.
    pub fn page_start_timestamp(&self, page: u16) -> i64 {
        self.start_timestamp() + page as i64 * 60
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

/// Wrapping sum of all bytes, used for the file header checksum.
pub fn additive_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, &byte| sum.wrapping_add(byte as u32))
}

pub(crate) fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn le_i64(buf: &[u8], at: usize) -> i64 {
    le_u64(buf, at) as i64
}
