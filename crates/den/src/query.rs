//! Query evaluation over partition files.
//!
//! A query is described by a [`PreparedQuery`]: a time range, an optional hit
//! limit and a per-record predicate. Evaluation asks the index for the files
//! overlapping the range, takes read access on each, skips pages whose minute
//! bucket falls outside the range, and feeds the remaining records to the
//! predicate. Per-file failures are collected in the [`QueryReport`] and the
//! scan moves on to the next file.

use crate::error::{DenError, Result};
use crate::format::{LabelValue, LogRecord};
use crate::index::{IndexItem, PartitionIndex};
use crate::page::PageFileReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Half-open time range `[start, end)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
}

impl TimeRange {
    /// Creates a range covering `[start, end)`.
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Whether `timestamp` is inside the range.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the range intersects `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A query ready for evaluation.
pub trait PreparedQuery {
    /// Records outside this range are never matched.
    fn time_range(&self) -> TimeRange;

    /// Maximum number of hits to return.
    fn limit(&self) -> Option<usize> {
        None
    }

    /// Predicate applied to every record inside the range.
    fn matches(&self, record: &LogRecord) -> bool;

    /// Called for every matching record.
    fn on_hit(&self, _record: &LogRecord) {}

    /// Called for every record inside the range that does not match.
    fn on_miss(&self, _record: &LogRecord) {}

    /// Called when a file cannot be scanned.
    fn on_error(&self, _path: &Path, _error: &DenError) {}
}

/// Query matching label equalities and a message substring.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::query::{LabelQuery, TimeRange};
///
/// let query = LabelQuery::new(TimeRange::new(start, end))
///     .with_label("service", "api")
///     .with_message_contains("timeout")
///     .with_limit(100);
/// ```
#[derive(Debug, Clone)]
pub struct LabelQuery {
    range: TimeRange,
    labels: Vec<(String, LabelValue)>,
    message_contains: Option<Vec<u8>>,
    limit: Option<usize>,
}

impl LabelQuery {
    /// Matches every record in `range`.
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            labels: Vec::new(),
            message_contains: None,
            limit: None,
        }
    }

    /// Requires label `key` to equal `value`.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<LabelValue>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Requires the message to contain `needle`.
    pub fn with_message_contains(mut self, needle: impl Into<Vec<u8>>) -> Self {
        self.message_contains = Some(needle.into());
        self
    }

    /// Caps the number of hits.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl PreparedQuery for LabelQuery {
    fn time_range(&self) -> TimeRange {
        self.range
    }

    fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn matches(&self, record: &LogRecord) -> bool {
        let labels_match = self
            .labels
            .iter()
            .all(|(key, value)| record.label(key) == Some(value));
        labels_match
            && self
                .message_contains
                .as_deref()
                .map_or(true, |needle| contains_bytes(&record.message, needle))
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// A file that could not be scanned.
#[derive(Debug, Clone)]
pub struct QueryError {
    /// File path.
    pub path: PathBuf,
    /// Error description.
    pub message: String,
}

/// Statistics of a query evaluation.
#[derive(Debug, Clone, Default)]
pub struct QueryReport {
    /// Wall time of the evaluation.
    pub elapsed: Duration,
    /// Records whose metadata was read.
    pub scanned: u64,
    /// Records inside the range that matched.
    pub hits: u64,
    /// Records inside the range that did not match.
    pub misses: u64,
    /// Files visited.
    pub files: usize,
    /// Pages read.
    pub pages: usize,
    /// Pages skipped by their minute bucket.
    pub pages_skipped: usize,
    /// Whether the hit limit stopped the scan before it was exhausted.
    pub truncated: bool,
    /// Files that failed.
    pub errors: Vec<QueryError>,
}

/// Records returned by a query and the report describing the scan.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Matching records in day, file, and page order.
    pub records: Vec<LogRecord>,
    /// Scan statistics.
    pub report: QueryReport,
}

/// Evaluates `query` against every file the index selects.
pub fn execute(index: &PartitionIndex, query: &dyn PreparedQuery) -> QueryResult {
    let started = Instant::now();
    let range = query.time_range();
    let mut result = QueryResult::default();

    if !range.is_empty() {
        for item in index.get_data_files_for_read(&range) {
            result.report.files += 1;
            match scan_file(&item, query, &range, &mut result) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!("Query skipped {}: {}", item.path().display(), e);
                    query.on_error(item.path(), &e);
                    result.report.errors.push(QueryError {
                        path: item.path().to_path_buf(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    result.report.elapsed = started.elapsed();
    debug!(
        "Query over [{}, {}) finished: {} hits, {} misses, {} files, {} errors in {:?}",
        range.start,
        range.end,
        result.report.hits,
        result.report.misses,
        result.report.files,
        result.report.errors.len(),
        result.report.elapsed
    );
    result
}

/// Scans one file. Returns true once the hit limit stopped the query.
fn scan_file(
    item: &Arc<IndexItem>,
    query: &dyn PreparedQuery,
    range: &TimeRange,
    result: &mut QueryResult,
) -> Result<bool> {
    let _access = item.await_read();

    let mut reader = PageFileReader::open(item.path())?;
    let day = reader.header()?.day;
    let limit = query.limit();

    while let Some(mut page) = reader.next_page()? {
        let page_start = day.page_start_timestamp(page.page_number());
        if !range.overlaps(page_start, page_start + 60) {
            result.report.pages_skipped += 1;
            continue;
        }
        result.report.pages += 1;

        while let Some(meta) = page.scan()? {
            result.report.scanned += 1;
            if !range.contains(meta.timestamp) {
                continue;
            }
            let record = LogRecord {
                timestamp: meta.timestamp,
                schema_version: meta.schema_version,
                labels: page.labels()?,
                message: page.message()?.to_vec(),
            };

            if query.matches(&record) {
                if limit.is_some_and(|limit| result.records.len() >= limit) {
                    result.report.truncated = true;
                    return Ok(true);
                }
                query.on_hit(&record);
                result.report.hits += 1;
                result.records.push(record);
            } else {
                query.on_miss(&record);
                result.report.misses += 1;
            }
        }
        page.finish()?;
    }
    Ok(false)
}
