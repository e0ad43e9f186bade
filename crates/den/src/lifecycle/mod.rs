//! Lifecycle management: page and file merging, and per-day compaction.

pub mod compaction;
pub mod merge;

pub use compaction::{CompactionPlan, CompactionReport, Compactor};
pub use merge::{merge_data_files, merge_data_pages, MergeStrategy, MergeSummary};
