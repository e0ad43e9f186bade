//! Page and file merging.
//!
//! Two pages with the same page number are merged record by record through a
//! timestamp-ordered min-heap. Two files of the same day are merged page by
//! page with one of three strategies, chosen from their page ranges:
//!
//! ```text
//! Append         A: [0 ..... 10]                 B: [20 ..... 40]
//! BoundaryMerge  A: [0 ..... 10]                 B: [10 ..... 40]   (page 10 merged)
//! Interleaved    A: [0 ... 5 ... 10 ... 30]      B: [3 ... 10 ... 40]
//! ```
//!
//! `Append` copies every page of both inputs. `BoundaryMerge` copies the
//! first input up to the shared page, merges it, then copies the rest of the
//! second. `Interleaved` walks both page lists in lockstep until the output
//! reaches the last page of either input, then copies the remainder.
//!
//! Pages present in only one input are copied verbatim when their encoding
//! matches the output configuration, and re-encoded otherwise.

use crate::config::WriterConfig;
use crate::error::{DenError, Result};
use crate::format::{FileHeader, LogRecord, PageHeader};
use crate::page::{PageFileReader, PageFileWriter, PageReader};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use tracing::debug;

/// How two files of the same day are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Page ranges are disjoint; pages are copied in order.
    Append,
    /// The ranges share exactly one boundary page, which is merged.
    BoundaryMerge,
    /// The ranges overlap; pages are walked in lockstep.
    Interleaved,
}

impl MergeStrategy {
    /// Chooses a strategy for two inclusive page ranges, ordered by first page.
    pub fn choose(first: Option<(u16, u16)>, second: Option<(u16, u16)>) -> Self {
        match (first, second) {
            (Some((_, a_last)), Some((b_first, _))) if a_last < b_first => Self::Append,
            (Some((_, a_last)), Some((b_first, _))) if a_last == b_first => Self::BoundaryMerge,
            (Some(_), Some(_)) => Self::Interleaved,
            _ => Self::Append,
        }
    }
}

/// Result of merging two files.
#[derive(Debug, Clone)]
pub struct MergeSummary {
    /// Header of the merged file.
    pub header: FileHeader,
    /// Strategy that was used.
    pub strategy: MergeStrategy,
    /// Pages merged record by record.
    pub merged_pages: usize,
    /// Pages copied from a single input.
    pub copied_pages: usize,
}

/// Merges two pages with the same number into a new page of `writer`.
///
/// Returns the header of the new page, whose record count and raw size are
/// the sums of the inputs.
///
/// # Errors
///
/// Returns `DenError::PageNumberMismatch` if the page numbers differ.
pub fn merge_data_pages(
    mut first: PageReader<'_>,
    mut second: PageReader<'_>,
    writer: &mut PageFileWriter,
) -> Result<PageHeader> {
    let page_number = first.page_number();
    if second.page_number() != page_number {
        return Err(DenError::PageNumberMismatch {
            expected: page_number,
            actual: second.page_number(),
        });
    }

    let mut records: Vec<Option<LogRecord>> = Vec::new();
    let mut heap = BinaryHeap::new();
    load_page(&mut first, 0, &mut records, &mut heap)?;
    load_page(&mut second, 1, &mut records, &mut heap)?;
    first.finish()?;
    second.finish()?;

    writer.append_page(page_number)?;
    while let Some(Reverse((_, _, slot))) = heap.pop() {
        if let Some(record) = records[slot].take() {
            writer.append_record(&record)?;
        }
    }

    let header = writer
        .finish_page()?
        .ok_or(DenError::PageNotSelected)?;
    debug!(
        "Merged page {}: {} records, {} bytes",
        page_number, header.record_count, header.raw_size
    );
    Ok(header)
}

/// Heap key: timestamp, then input order, then position within the input.
type MergeKey = Reverse<(i64, u8, usize)>;

fn load_page(
    page: &mut PageReader<'_>,
    source: u8,
    records: &mut Vec<Option<LogRecord>>,
    heap: &mut BinaryHeap<MergeKey>,
) -> Result<()> {
    while let Some(record) = page.next_record()? {
        heap.push(Reverse((record.timestamp, source, records.len())));
        records.push(Some(record));
    }
    Ok(())
}

/// Merges two files of the same day into a new file at `out_path`.
///
/// # Errors
///
/// Returns `DenError::FileMismatch` if the files belong to different days.
pub fn merge_data_files(
    first_path: &Path,
    second_path: &Path,
    out_path: &Path,
    file_id: u64,
    config: &WriterConfig,
) -> Result<MergeSummary> {
    let mut first = PageFileReader::open(first_path)?;
    let mut second = PageFileReader::open(second_path)?;
    let first_header = first.header()?.clone();
    let second_header = second.header()?.clone();
    if first_header.day != second_header.day {
        return Err(DenError::FileMismatch {
            expected: first_header.day,
            actual: second_header.day,
        });
    }

    // Order inputs by first page so the strategy only looks forward.
    let swap = match (first_header.first_page, second_header.first_page) {
        (Some(a), Some(b)) => b < a,
        (None, Some(_)) => true,
        _ => false,
    };
    let (mut a, mut b, a_header, b_header) = if swap {
        (second, first, second_header, first_header)
    } else {
        (first, second, first_header, second_header)
    };

    let strategy = MergeStrategy::choose(a_header.page_range(), b_header.page_range());
    let a_pages = a.page_headers()?;
    let b_pages = b.page_headers()?;

    let mut writer = PageFileWriter::create(out_path, a_header.day, file_id, config.clone())?;
    let mut counts = PageCounts::default();

    match strategy {
        MergeStrategy::Append => {
            counts.copy_all(&mut a, &a_pages, &mut writer)?;
            counts.copy_all(&mut b, &b_pages, &mut writer)?;
        }
        MergeStrategy::BoundaryMerge => {
            let (Some(((_, boundary), a_head)), Some((_, b_tail))) =
                (a_pages.split_last(), b_pages.split_first())
            else {
                return Err(DenError::PageNotSelected);
            };
            counts.copy_all(&mut a, a_head, &mut writer)?;
            counts.merge(&mut a, &mut b, boundary.page_number, &mut writer)?;
            counts.copy_all(&mut b, b_tail, &mut writer)?;
        }
        MergeStrategy::Interleaved => {
            let a_last = a_pages.last().map(|(_, page)| page.page_number);
            let b_last = b_pages.last().map(|(_, page)| page.page_number);
            let (mut i, mut j) = (0, 0);

            // Lockstep until the output reaches the last page of either input.
            while let (Some(&(a_offset, pa)), Some(&(b_offset, pb))) =
                (a_pages.get(i), b_pages.get(j))
            {
                let emitted = if pa.page_number == pb.page_number {
                    counts.merge(&mut a, &mut b, pa.page_number, &mut writer)?;
                    i += 1;
                    j += 1;
                    pa.page_number
                } else if pa.page_number < pb.page_number {
                    counts.copy(&mut a, a_offset, pa, &mut writer)?;
                    i += 1;
                    pa.page_number
                } else {
                    counts.copy(&mut b, b_offset, pb, &mut writer)?;
                    j += 1;
                    pb.page_number
                };
                if Some(emitted) == a_last || Some(emitted) == b_last {
                    break;
                }
            }

            // At most one input has pages left.
            counts.copy_all(&mut a, &a_pages[i..], &mut writer)?;
            counts.copy_all(&mut b, &b_pages[j..], &mut writer)?;
        }
    }

    let header = writer.close()?;
    let expected = a_header.record_count + b_header.record_count;
    if header.record_count != expected {
        return Err(DenError::Corrupted(format!(
            "merged {} records into {}, expected {}",
            header.record_count,
            out_path.display(),
            expected
        )));
    }

    debug!(
        "Merged {} and {} into {} ({:?}, {} merged pages, {} copied pages)",
        first_path.display(),
        second_path.display(),
        out_path.display(),
        strategy,
        counts.merged,
        counts.copied
    );
    Ok(MergeSummary {
        header,
        strategy,
        merged_pages: counts.merged,
        copied_pages: counts.copied,
    })
}

#[derive(Default)]
struct PageCounts {
    merged: usize,
    copied: usize,
}

impl PageCounts {
    fn merge(
        &mut self,
        a: &mut PageFileReader,
        b: &mut PageFileReader,
        page_number: u16,
        writer: &mut PageFileWriter,
    ) -> Result<()> {
        let left = a.select_page(page_number)?.ok_or(DenError::PageNotSelected)?;
        let right = b.select_page(page_number)?.ok_or(DenError::PageNotSelected)?;
        merge_data_pages(left, right, writer)?;
        self.merged += 1;
        Ok(())
    }

    fn copy(
        &mut self,
        reader: &mut PageFileReader,
        offset: u64,
        header: PageHeader,
        writer: &mut PageFileWriter,
    ) -> Result<()> {
        copy_page(reader, offset, header, writer)?;
        self.copied += 1;
        Ok(())
    }

    fn copy_all(
        &mut self,
        reader: &mut PageFileReader,
        pages: &[(u64, PageHeader)],
        writer: &mut PageFileWriter,
    ) -> Result<()> {
        for &(offset, header) in pages {
            self.copy(reader, offset, header, writer)?;
        }
        Ok(())
    }
}

/// Copies one page into `writer`, verbatim when the encodings agree.
fn copy_page(
    reader: &mut PageFileReader,
    offset: u64,
    header: PageHeader,
    writer: &mut PageFileWriter,
) -> Result<()> {
    if header.compression == writer.config().compression {
        let span = reader.read_raw_page(offset, &header)?;
        return writer.append_raw_page(header, &span);
    }

    let mut page = reader
        .select_page(header.page_number)?
        .ok_or(DenError::PageNotSelected)?;
    let records = page.read_records()?;
    page.finish()?;

    writer.append_page(header.page_number)?;
    for record in &records {
        writer.append_record(record)?;
    }
    writer.finish_page()?;
    Ok(())
}
