//! Per-day compaction of partition files.

use crate::config::CompactionConfig;
use crate::error::{DenError, Result};
use crate::format::{DayKey, FileHeader};
use crate::index::{IndexItem, PartitionIndex, WriteAccess, TEMP_SUFFIX};
use crate::lifecycle::merge::{merge_data_files, MergeStrategy};
use crate::page::DataFileInfo;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of compacting one day.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::lifecycle::CompactionReport;
///
/// let report = compactor.compact_day(day)?;
/// println!("{} files -> {:?}", report.input_files.len(), report.output);
/// ```
#[derive(Debug, Clone)]
pub struct CompactionReport {
    /// Compacted day.
    pub day: DayKey,
    /// Files merged away.
    pub input_files: Vec<PathBuf>,
    /// Merged file, `None` when nothing needed compaction.
    pub output: Option<PathBuf>,
    /// Records in the merged file.
    pub records: u64,
    /// Strategy of every pairwise merge, in fold order.
    pub strategies: Vec<MergeStrategy>,
    /// Wall time.
    pub elapsed: Duration,
}

impl CompactionReport {
    fn skipped(day: DayKey) -> Self {
        Self {
            day,
            input_files: Vec::new(),
            output: None,
            records: 0,
            strategies: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Compaction plan for a day.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// Target day.
    pub day: DayKey,
    /// Files to fold into one, oldest first.
    pub inputs: Vec<Arc<IndexItem>>,
}

/// Folds the files of a day pairwise into a single file.
///
/// Inputs are merged through `.den.tmp` files, the result is renamed into
/// place and registered, and only then are the inputs deleted.
pub struct Compactor {
    index: Arc<PartitionIndex>,
    config: CompactionConfig,
}

impl Compactor {
    /// Creates a compactor over `index`.
    pub fn new(index: Arc<PartitionIndex>, config: CompactionConfig) -> Self {
        Self { index, config }
    }

    /// Returns a plan when `day` holds more files than allowed.
    ///
    /// The oldest files are folded so that the day ends up with at most
    /// `max_files_per_day` files.
    pub fn plan(&self, day: DayKey) -> Option<CompactionPlan> {
        let files = self.index.files_for_day(day);
        let max = self.config.max_files_per_day.max(1);
        if files.len() <= max {
            return None;
        }
        let fold = files.len() - max + 1;
        Some(CompactionPlan {
            day,
            inputs: files.into_iter().take(fold).collect(),
        })
    }

    /// Compacts `day` if it needs it.
    pub fn compact_day(&self, day: DayKey) -> Result<CompactionReport> {
        match self.plan(day) {
            Some(plan) => self.run(plan),
            None => Ok(CompactionReport::skipped(day)),
        }
    }

    /// Runs a compaction plan.
    pub fn run(&self, plan: CompactionPlan) -> Result<CompactionReport> {
        let started = Instant::now();
        let day = plan.day;
        // Exclusive access keeps readers and the write cursor off the inputs.
        let accesses: Vec<WriteAccess> =
            plan.inputs.iter().map(|item| item.await_write()).collect();

        let mut temps: Vec<PathBuf> = Vec::new();
        let folded = self.fold(&plan, &mut temps);
        let (tmp_path, file_id, header, strategies) = match folded {
            Ok(folded) => folded,
            Err(e) => {
                warn!("Compaction of {} failed: {}", day, e);
                for tmp in &temps {
                    remove_quietly(tmp);
                }
                return Err(e);
            }
        };

        let output = DataFileInfo::path_in(self.index.data_dir(), day, file_id);
        let sync_mode = self.config.sync_mode;
        fs::rename(&tmp_path, &output)?;
        sync_mode.sync_dir(self.index.data_dir())?;
        for tmp in temps.iter().filter(|tmp| **tmp != tmp_path) {
            remove_quietly(tmp);
        }

        let records = header.record_count;
        self.index.register_file(output.clone(), header);
        for item in &plan.inputs {
            self.index.remove_file(item);
        }
        for item in &plan.inputs {
            fs::remove_file(item.path())?;
        }
        sync_mode.sync_dir(self.index.data_dir())?;
        drop(accesses);

        let elapsed = started.elapsed();
        info!(
            "Compacted {} files of {} into {} ({} records) in {:?}",
            plan.inputs.len(),
            day,
            output.display(),
            records,
            elapsed
        );
        let report = CompactionReport {
            day,
            input_files: plan.inputs.iter().map(|item| item.path().to_path_buf()).collect(),
            output: Some(output),
            records,
            strategies,
            elapsed,
        };
        Ok(report)
    }

    #[allow(clippy::type_complexity)]
    fn fold(
        &self,
        plan: &CompactionPlan,
        temps: &mut Vec<PathBuf>,
    ) -> Result<(PathBuf, u64, FileHeader, Vec<MergeStrategy>)> {
        let Some((first, rest)) = plan.inputs.split_first() else {
            return Err(DenError::Corrupted(format!(
                "compaction plan for {} is empty",
                plan.day
            )));
        };
        let writer_config = self.config.writer_config();
        let mut strategies = Vec::new();
        let mut acc = first.path().to_path_buf();
        let mut result = None;

        for item in rest {
            let file_id = self.index.allocate_file_id();
            let tmp = temp_path(self.index.data_dir(), plan.day, file_id);
            temps.push(tmp.clone());

            let summary = merge_data_files(&acc, item.path(), &tmp, file_id, &writer_config)?;
            strategies.push(summary.strategy);
            acc = tmp.clone();
            result = Some((tmp, file_id, summary.header));
        }

        match result {
            Some((tmp, file_id, header)) => Ok((tmp, file_id, header, strategies)),
            None => Err(DenError::Corrupted(format!(
                "compaction plan for {} has a single input",
                plan.day
            ))),
        }
    }
}

fn temp_path(dir: &Path, day: DayKey, file_id: u64) -> PathBuf {
    let name = format!("{}.{}", DataFileInfo::file_name(day, file_id), TEMP_SUFFIX);
    dir.join(name)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
