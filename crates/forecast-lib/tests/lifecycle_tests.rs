//! End-to-end lifecycle tests for the forecast engine
//!
//! Exercises the full path: baseline import, rolling two-step forecast with a
//! scripted executor, combined data-and-predictions reads, daily reset and
//! capacity recommendation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use forecast_lib::{
    format_time, parse_time_dt, CapacityThresholds, ExecutorDiagnostics, ForecastEngine,
    ForecastExecutor, Metric, OrchestratorConfig, Result, SeriesSample, TimeSeriesStore,
};

const BASE_TIME: i64 = 1_700_000_000;
const CADENCE_SECS: i64 = 180;

/// Continues the snapshot's time series at the sampling cadence, writing one
/// forecast file per metric.
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
                let t = last_time + (i as i64 + 1) * CADENCE_SECS;
                let value = match metric {
                    Metric::Cpu => 0.4 + i as f64 * 0.001,
                    Metric::Memory => 100.0 + i as f64,
                };
                out.push_str(&format!("{},{}\n", format_time(t), value));
            }
            fs::write(
                output_dir.join(format!("{}_{}.csv", prefix, metric.column())),
                out,
            )?;
        }
        Ok(ExecutorDiagnostics::default())
    }
}

fn seeded_engine(dir: &Path, history_points: usize) -> (ForecastEngine, i64) {
    let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
    let user = store.ensure_user("alice").unwrap();
    let samples: Vec<SeriesSample> = (0..history_points)
        .map(|i| SeriesSample {
            time: BASE_TIME + i as i64 * CADENCE_SECS,
            cpu: Some(0.5 + (i % 10) as f64 * 0.01),
            memory: Some(120.0 + (i % 10) as f64),
        })
        .collect();
    store.import_baseline(user, &samples).unwrap();

    let config = OrchestratorConfig::new(dir.join("work"), dir.join("out"));
    let engine = ForecastEngine::new(
        store,
        Arc::new(ScriptedExecutor { rows_per_metric: 240 }),
        config,
    );
    (engine, user)
}

#[tokio::test]
async fn test_full_lifecycle_produces_complete_forecast() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, user) = seeded_engine(dir.path(), 1000);

    let summary = engine.run_forecast(user).await.unwrap();
    assert_eq!(summary.completed_steps, 2);
    assert_eq!(summary.total_predictions, 480);

    // Both metrics coalesced on the same rows.
    let cpu = engine.latest_predictions(Metric::Cpu, 480, user).unwrap();
    let memory = engine.latest_predictions(Metric::Memory, 480, user).unwrap();
    assert_eq!(cpu.len(), 480);
    assert_eq!(memory.len(), 480);
    assert!(cpu.iter().all(|p| p.cpu.is_some()));
    assert!(memory.iter().all(|p| p.memory.is_some()));

    // Rolling window preserved through both promotions.
    assert_eq!(engine.store().historical_count(user).unwrap(), 1000);
}

#[tokio::test]
async fn test_data_and_predictions_shapes_and_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, user) = seeded_engine(dir.path(), 1000);
    engine.run_forecast(user).await.unwrap();

    let combined = engine
        .data_and_predictions(Metric::Cpu, 100, 240, user)
        .unwrap();
    assert_eq!(combined.historical.len(), 100);
    assert_eq!(combined.predictions.len(), 240);

    // History chronological, predictions ascending by sequence.
    assert!(combined
        .historical
        .windows(2)
        .all(|w| w[0].time < w[1].time));
    assert!(combined
        .predictions
        .windows(2)
        .all(|w| w[0].sequence_idx < w[1].sequence_idx));
    // The prediction slice is the most recent one.
    assert_eq!(combined.predictions.last().unwrap().sequence_idx, 479);
}

#[tokio::test]
async fn test_daily_reset_restores_baseline_then_reforecasts() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, user) = seeded_engine(dir.path(), 1000);
    engine.run_forecast(user).await.unwrap();

    // Promotions rotated the window forward; the oldest baseline time is gone.
    let before = engine.store().historical_points(user).unwrap();
    assert!(before[0].time > BASE_TIME);

    let summary = engine.daily_reset(user).await.unwrap();

    // Reset restored the exact baseline before the fresh run rotated it again,
    // and the fresh run produced a full forecast.
    assert_eq!(summary.total_predictions, 480);
    assert_eq!(engine.store().historical_count(user).unwrap(), 1000);
    assert_eq!(engine.store().baseline_count(user).unwrap(), 1000);
}

#[tokio::test]
async fn test_daily_reset_all_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _user) = seeded_engine(dir.path(), 1000);
    // Second user has no history, so its reset-and-reforecast must fail
    // without blocking the first user's.
    engine.store().ensure_user("empty").unwrap();

    let report = engine.daily_reset_all().await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_recommendation_before_and_after_forecast() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, user) = seeded_engine(dir.path(), 1000);
    let thresholds = CapacityThresholds::default();

    let rec = engine.recommend(user, &thresholds).unwrap();
    assert!(rec.used_defaults);
    assert_eq!(rec.applied_instances, thresholds.min_instances);

    engine.run_forecast(user).await.unwrap();
    let rec = engine.recommend(user, &thresholds).unwrap();
    assert!(!rec.used_defaults);
    assert!(rec.peak_predicted > 0.0);
    assert!(rec.applied_instances >= thresholds.min_instances);
    assert!(rec.applied_instances <= thresholds.max_instances);
}
