//! Reconciliation of partial per-metric forecast outputs
//!
//! The executor writes CPU and memory forecasts through separate files, often
//! across separate invocations. The merger parses each file, derives sequence
//! indexes from the step and the file's emitted row order, groups rows by
//! resolved user and upserts them under the merge-not-overwrite rule so the
//! two metrics coalesce into single logical records without data loss.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};
use crate::models::{parse_time_dt, Metric};
use crate::store::{MergeRow, TimeSeriesStore};

/// Outcome counts for one step import batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportOutcome {
    /// Files parsed and committed.
    pub files_processed: usize,
    /// Files that failed as a whole (unreadable, undeterminable metric,
    /// rolled-back transaction). Never blocks the remaining files.
    pub files_failed: usize,
    /// Rows merged into the store.
    pub imported: usize,
    /// Rows dropped for an unparseable timestamp or value. Each still
    /// consumes its ordinal, so the resulting sequence gap records the loss.
    pub skipped_rows: usize,
    /// Merged row counts per resolved user id.
    pub per_user: HashMap<i64, usize>,
}

struct FileImport {
    imported: usize,
    skipped: usize,
    per_user: HashMap<i64, usize>,
}

/// Parses forecast output files and merges them into the store.
pub struct ReconciliationMerger {
    store: Arc<TimeSeriesStore>,
    block_size: u32,
}

impl ReconciliationMerger {
    pub fn new(store: Arc<TimeSeriesStore>, block_size: u32) -> Self {
        Self { store, block_size }
    }

    /// Import every output file matching `prefix` for the given step. Each
    /// file commits in its own transaction; a file-level failure is counted
    /// and the batch continues.
    pub fn import_step_outputs(
        &self,
        default_user: i64,
        step: u32,
        output_dir: &Path,
        prefix: &str,
        prediction_type: &str,
    ) -> Result<ImportOutcome> {
        let mut files = discover_outputs(output_dir, prefix)?;
        files.sort();

        let mut outcome = ImportOutcome::default();
        for path in files {
            match self.import_file(default_user, step, &path, prediction_type) {
                Ok(file) => {
                    outcome.files_processed += 1;
                    outcome.imported += file.imported;
                    outcome.skipped_rows += file.skipped;
                    for (user, count) in file.per_user {
                        *outcome.per_user.entry(user).or_default() += count;
                    }
                }
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        step,
                        error = %e,
                        "forecast output file failed, continuing with remaining files"
                    );
                    outcome.files_failed += 1;
                }
            }
        }
        debug!(
            step,
            prefix,
            files_processed = outcome.files_processed,
            files_failed = outcome.files_failed,
            imported = outcome.imported,
            skipped_rows = outcome.skipped_rows,
            "step outputs imported"
        );
        Ok(outcome)
    }

    fn import_file(
        &self,
        default_user: i64,
        step: u32,
        path: &Path,
        prediction_type: &str,
    ) -> Result<FileImport> {
        let content = fs::read_to_string(path)?;
        let mut lines = content.lines();
        let header = lines.next().ok_or_else(|| ForecastError::ImportFile {
            path: path.to_path_buf(),
            reason: "empty file".into(),
        })?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metric = Metric::from_file_name(&file_name)
            .or_else(|| columns.iter().find_map(|c| Metric::from_column(c)))
            .ok_or_else(|| ForecastError::ImportFile {
                path: path.to_path_buf(),
                reason: "cannot determine target metric from file name or header".into(),
            })?;

        let time_idx = columns
            .iter()
            .position(|c| *c == "time_dt")
            .ok_or_else(|| ForecastError::ImportFile {
                path: path.to_path_buf(),
                reason: "header has no time_dt column".into(),
            })?;
        let value_idx = columns
            .iter()
            .position(|c| Metric::from_column(c) == Some(metric))
            .unwrap_or(1);
        let user_idx = columns.iter().position(|c| *c == "user");

        let base = (step as i64 - 1) * self.block_size as i64;
        let mut rows: Vec<MergeRow> = Vec::new();
        let mut skipped = 0usize;
        let mut ordinal: i64 = 0;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            // The emitted row order is authoritative: a dropped row still
            // consumes its ordinal, never shifting later indexes.
            let sequence_idx = base + ordinal;
            ordinal += 1;

            let fields: Vec<&str> = line.split(',').collect();
            let time = fields.get(time_idx).and_then(|f| parse_time_dt(f));
            let value = fields
                .get(value_idx)
                .and_then(|f| f.trim().parse::<f64>().ok());
            let (time, value) = match (time, value) {
                (Some(t), Some(v)) => (t, v),
                _ => {
                    warn!(
                        file = %file_name,
                        row = sequence_idx - base,
                        "dropping row with unparseable timestamp or value"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let user_id = match user_idx.and_then(|i| fields.get(i)).map(|f| f.trim()) {
                Some(tag) if !tag.is_empty() => self.store.ensure_user(tag)?,
                _ => default_user,
            };

            rows.push(MergeRow {
                user_id,
                sequence_idx,
                time: Some(time),
                value,
            });
        }

        let mut per_user: HashMap<i64, usize> = HashMap::new();
        for row in &rows {
            *per_user.entry(row.user_id).or_default() += 1;
        }
        let imported = self
            .store
            .merge_prediction_rows(prediction_type, metric, &rows)?;
        Ok(FileImport {
            imported,
            skipped,
            per_user,
        })
    }
}

fn discover_outputs(output_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(".csv") {
            files.push(entry.path());
        }
    }
    Ok(files)
}
