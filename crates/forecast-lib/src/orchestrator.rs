//! Multi-step rolling forecast orchestration
//!
//! Drives N rolling steps per user. Each step exports the current historical
//! window as a snapshot, invokes the external forecaster, reconciles its
//! partial outputs into the store and promotes the new block into history so
//! the next step's export already contains it as pseudo-ground-truth.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ForecastError, Result};
use crate::executor::ForecastExecutor;
use crate::merger::ReconciliationMerger;
use crate::models::{format_time, DEFAULT_PREDICTION_TYPE, SNAPSHOT_HEADER};
use crate::observability::EngineMetrics;
use crate::rotator::HistoryRotator;
use crate::store::TimeSeriesStore;

/// Rolling steps per run.
pub const TOTAL_STEPS: u32 = 2;

/// Points produced by one forecaster invocation, at the 3-minute cadence.
pub const BLOCK_SIZE: u32 = 240;

/// In-flight entries older than this are considered abandoned (crashed run)
/// and may be reclaimed.
const RUN_EXPIRY: Duration = Duration::from_secs(2 * 60 * 60);

/// Configuration for the step orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub total_steps: u32,
    pub block_size: u32,
    pub prediction_type: String,
    /// Directory for transient snapshot artifacts.
    pub work_dir: PathBuf,
    /// Directory the executor writes forecast files into.
    pub output_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(work_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            total_steps: TOTAL_STEPS,
            block_size: BLOCK_SIZE,
            prediction_type: DEFAULT_PREDICTION_TYPE.to_string(),
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
        }
    }
}

/// Per-step outcome. A failed step carries its reason and does not abort the
/// remaining steps unless the executor itself failed.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: u32,
    pub imported: usize,
    pub skipped_rows: usize,
    pub files_failed: usize,
    pub promoted: usize,
    pub failure: Option<String>,
}

/// Result of one full rolling-forecast run.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastRunSummary {
    pub user_id: i64,
    /// Actual prediction rows in the store after the run.
    pub total_predictions: i64,
    pub completed_steps: u32,
    pub steps: Vec<StepOutcome>,
}

/// Keyed registry of in-flight runs. At most one run per
/// (user, prediction_type); entries past [`RUN_EXPIRY`] are reclaimed.
pub struct RunRegistry {
    inflight: DashMap<(i64, String), Instant>,
    expiry: Duration,
}

impl RunRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            expiry,
        }
    }

    /// Claim the key, or return None if a live run already holds it.
    pub fn try_begin(&self, user_id: i64, prediction_type: &str) -> Option<RunGuard<'_>> {
        use dashmap::mapref::entry::Entry;
        let key = (user_id, prediction_type.to_string());
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().elapsed() < self.expiry {
                    return None;
                }
                warn!(
                    user_id,
                    prediction_type, "reclaiming expired in-flight run entry"
                );
                entry.insert(Instant::now());
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        Some(RunGuard {
            registry: self,
            key,
        })
    }
}

/// Releases the registry slot when the run ends, however it ends.
pub struct RunGuard<'a> {
    registry: &'a RunRegistry,
    key: (i64, String),
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.inflight.remove(&self.key);
    }
}

/// Drives the rolling-forecast steps for a user.
pub struct StepOrchestrator {
    store: Arc<TimeSeriesStore>,
    executor: Arc<dyn ForecastExecutor>,
    merger: ReconciliationMerger,
    rotator: HistoryRotator,
    registry: RunRegistry,
    config: OrchestratorConfig,
    metrics: EngineMetrics,
}

impl StepOrchestrator {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        executor: Arc<dyn ForecastExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            merger: ReconciliationMerger::new(store.clone(), config.block_size),
            rotator: HistoryRotator::new(store.clone()),
            registry: RunRegistry::new(RUN_EXPIRY),
            store,
            executor,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Run a full rolling forecast for one user.
    ///
    /// Executor failure aborts the run; effects of prior completed steps
    /// remain committed (no cross-step rollback). A step whose outputs never
    /// appeared is recorded as failed but later steps still run.
    pub async fn run_forecast(&self, user_id: i64) -> Result<ForecastRunSummary> {
        let prediction_type = self.config.prediction_type.clone();
        let _guard = self
            .registry
            .try_begin(user_id, &prediction_type)
            .ok_or_else(|| {
                self.metrics.inc_runs_rejected();
                ForecastError::RunInProgress {
                    user_id,
                    prediction_type: prediction_type.clone(),
                }
            })?;

        if self.store.historical_count(user_id)? == 0 {
            return Err(ForecastError::DataUnavailable { user_id });
        }
        fs::create_dir_all(&self.config.work_dir)?;
        fs::create_dir_all(&self.config.output_dir)?;

        info!(
            user_id,
            prediction_type = %prediction_type,
            total_steps = self.config.total_steps,
            block_size = self.config.block_size,
            "starting rolling forecast run"
        );

        let mut steps = Vec::with_capacity(self.config.total_steps as usize);
        let mut completed_steps = 0;
        for step in 1..=self.config.total_steps {
            let outcome = self.run_step(user_id, step).await?;
            if outcome.failure.is_none() {
                completed_steps += 1;
                self.metrics.inc_steps_completed();
            } else {
                self.metrics.inc_steps_failed();
            }
            steps.push(outcome);
        }

        let total_predictions = self.store.prediction_count(user_id, &prediction_type)?;
        let expected = (self.config.total_steps * self.config.block_size) as i64;
        if total_predictions != expected {
            // Reconciled with warning, never an error.
            warn!(
                user_id,
                actual = total_predictions,
                expected,
                "prediction row count differs from expected after run"
            );
        }
        info!(
            user_id,
            total_predictions, completed_steps, "rolling forecast run finished"
        );
        Ok(ForecastRunSummary {
            user_id,
            total_predictions,
            completed_steps,
            steps,
        })
    }

    async fn run_step(&self, user_id: i64, step: u32) -> Result<StepOutcome> {
        let snapshot = self.export_snapshot(user_id, step)?;
        let prefix = format!(
            "step{}_user{}_{}",
            step,
            user_id,
            chrono::Utc::now().timestamp()
        );

        let started = Instant::now();
        let exec_result = self
            .executor
            .execute(&snapshot, &self.config.output_dir, &prefix)
            .await;
        self.metrics
            .observe_executor_latency(started.elapsed().as_secs_f64());

        if let Err(e) = exec_result {
            let _ = fs::remove_file(&snapshot);
            self.metrics.inc_steps_failed();
            error!(user_id, step, error = %e, "executor failure aborts forecast run");
            return Err(e);
        }

        let import = self.merger.import_step_outputs(
            user_id,
            step,
            &self.config.output_dir,
            &prefix,
            &self.config.prediction_type,
        )?;
        self.metrics.add_rows_imported(import.imported as u64);
        self.metrics.add_rows_skipped(import.skipped_rows as u64);
        self.metrics.add_files_failed(import.files_failed as u64);

        let mut failure = None;
        let mut promoted = 0;
        if import.imported == 0 {
            // Executor reported success but usable outputs never appeared;
            // record the step as failed and keep going for robustness.
            failure = Some(if import.files_processed == 0 && import.files_failed == 0 {
                "executor reported success but produced no output files".to_string()
            } else {
                "no rows survived import".to_string()
            });
            warn!(user_id, step, reason = %failure.as_deref().unwrap_or(""), "step failed");
        } else {
            let stats = self.rotator.promote_step_into_history(
                user_id,
                &self.config.prediction_type,
                self.config.block_size as usize,
            )?;
            promoted = stats.promoted;
            self.metrics.add_points_promoted(promoted as u64);
        }

        if let Err(e) = fs::remove_file(&snapshot) {
            debug!(snapshot = %snapshot.display(), error = %e, "failed to remove snapshot artifact");
        }

        Ok(StepOutcome {
            step,
            imported: import.imported,
            skipped_rows: import.skipped_rows,
            files_failed: import.files_failed,
            promoted,
            failure,
        })
    }

    /// Export the user's current historical window, time ascending, as the
    /// transient snapshot fed to the executor.
    fn export_snapshot(&self, user_id: i64, step: u32) -> Result<PathBuf> {
        let points = self.store.historical_points(user_id)?;
        let username = self
            .store
            .user(user_id)?
            .map(|u| u.username)
            .unwrap_or_else(|| format!("user{user_id}"));

        let mut content = String::with_capacity(points.len() * 48);
        content.push_str(SNAPSHOT_HEADER);
        content.push('\n');
        for p in &points {
            let cpu = p.cpu.map(|v| v.to_string()).unwrap_or_default();
            let memory = p.memory.map(|v| v.to_string()).unwrap_or_default();
            content.push_str(&format!(
                "{},{},{},{}\n",
                format_time(p.time),
                cpu,
                memory,
                username
            ));
        }

        let path = self
            .config
            .work_dir
            .join(format!("history_user{user_id}_step{step}.csv"));
        fs::write(&path, content)?;
        debug!(
            user_id,
            step,
            rows = points.len(),
            snapshot = %path.display(),
            "historical snapshot exported"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorDiagnostics;
    use crate::models::{parse_time_dt, Metric, SeriesSample};
    use async_trait::async_trait;
    use std::path::Path;

    /// Scripted executor: continues the snapshot's time series at the
    /// 3-minute cadence and writes one file per metric.
    struct ScriptedExecutor {
        rows_per_metric: usize,
    }

    #[async_trait]
    impl ForecastExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            input: &Path,
            output_dir: &Path,
            prefix: &str,
        ) -> Result<ExecutorDiagnostics> {
            let content = fs::read_to_string(input)?;
            let last_time = content
                .lines()
                .skip(1)
                .filter_map(|l| parse_time_dt(l.split(',').next()?))
                .max()
                .expect("snapshot has no rows");

            for metric in [Metric::Cpu, Metric::Memory] {
                let mut out = format!("time_dt,{}\n", metric.column());
                for i in 0..self.rows_per_metric {
                    let t = last_time + (i as i64 + 1) * 180;
                    out.push_str(&format!(
                        "{},{}\n",
                        format_time(t),
                        0.4 + i as f64 * 0.001
                    ));
                }
                fs::write(
                    output_dir.join(format!("{}_{}.csv", prefix, metric.column())),
                    out,
                )?;
            }
            Ok(ExecutorDiagnostics::default())
        }
    }

    /// Executor that always fails.
    struct FailingExecutor;

    #[async_trait]
    impl ForecastExecutor for FailingExecutor {
        async fn execute(&self, _: &Path, _: &Path, _: &str) -> Result<ExecutorDiagnostics> {
            Err(ForecastError::ExecutorFailure {
                reason: "exit status 1".into(),
            })
        }
    }

    /// Executor that succeeds but writes nothing.
    struct SilentExecutor;

    #[async_trait]
    impl ForecastExecutor for SilentExecutor {
        async fn execute(&self, _: &Path, _: &Path, _: &str) -> Result<ExecutorDiagnostics> {
            Ok(ExecutorDiagnostics::default())
        }
    }

    fn seeded_store(points: usize) -> (Arc<TimeSeriesStore>, i64) {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let user = store.ensure_user("alice").unwrap();
        let samples: Vec<SeriesSample> = (0..points)
            .map(|i| SeriesSample {
                time: 1_700_000_000 + i as i64 * 180,
                cpu: Some(0.5),
                memory: Some(100.0),
            })
            .collect();
        store.import_baseline(user, &samples).unwrap();
        (store, user)
    }

    fn orchestrator(
        store: Arc<TimeSeriesStore>,
        executor: Arc<dyn ForecastExecutor>,
        dir: &Path,
    ) -> StepOrchestrator {
        let config = OrchestratorConfig {
            total_steps: 2,
            block_size: 240,
            ..OrchestratorConfig::new(dir.join("work"), dir.join("out"))
        };
        StepOrchestrator::new(store, executor, config)
    }

    #[tokio::test]
    async fn test_full_run_yields_contiguous_sequence() {
        let (store, user) = seeded_store(500);
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            store.clone(),
            Arc::new(ScriptedExecutor { rows_per_metric: 240 }),
            dir.path(),
        );

        let summary = orch.run_forecast(user).await.unwrap();
        assert_eq!(summary.completed_steps, 2);
        assert_eq!(summary.total_predictions, 480);

        let idxs = store.sequence_indexes(user, DEFAULT_PREDICTION_TYPE).unwrap();
        assert_eq!(idxs, (0..480).collect::<Vec<i64>>());
        // The rolling window never changed size.
        assert_eq!(store.historical_count(user).unwrap(), 500);
    }

    #[tokio::test]
    async fn test_zero_history_fails_fast() {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let user = store.ensure_user("empty").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            store,
            Arc::new(ScriptedExecutor { rows_per_metric: 240 }),
            dir.path(),
        );

        let err = orch.run_forecast(user).await.unwrap_err();
        assert!(matches!(err, ForecastError::DataUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_executor_failure_aborts_run() {
        let (store, user) = seeded_store(300);
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(store.clone(), Arc::new(FailingExecutor), dir.path());

        let err = orch.run_forecast(user).await.unwrap_err();
        assert!(matches!(err, ForecastError::ExecutorFailure { .. }));
        assert_eq!(
            store.prediction_count(user, DEFAULT_PREDICTION_TYPE).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_missing_outputs_fail_step_without_aborting() {
        let (store, user) = seeded_store(300);
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(store.clone(), Arc::new(SilentExecutor), dir.path());

        let summary = orch.run_forecast(user).await.unwrap();
        assert_eq!(summary.completed_steps, 0);
        assert_eq!(summary.steps.len(), 2);
        assert!(summary.steps.iter().all(|s| s.failure.is_some()));
        assert_eq!(summary.total_predictions, 0);
    }

    #[tokio::test]
    async fn test_snapshot_artifacts_removed() {
        let (store, user) = seeded_store(300);
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            store,
            Arc::new(ScriptedExecutor { rows_per_metric: 240 }),
            dir.path(),
        );
        orch.run_forecast(user).await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("work"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_run_registry_rejects_second_claim() {
        let registry = RunRegistry::new(Duration::from_secs(3600));
        let guard = registry.try_begin(1, "xgboost").unwrap();
        assert!(registry.try_begin(1, "xgboost").is_none());
        // Distinct users are independent.
        assert!(registry.try_begin(2, "xgboost").is_some());
        drop(guard);
        assert!(registry.try_begin(1, "xgboost").is_some());
    }

    #[test]
    fn test_run_registry_reclaims_expired_entry() {
        let registry = RunRegistry::new(Duration::from_secs(0));
        let _guard = registry.try_begin(1, "xgboost").unwrap();
        assert!(registry.try_begin(1, "xgboost").is_some());
    }
}
