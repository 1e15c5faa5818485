//! Observability infrastructure for the forecast engine
//!
//! Prometheus metrics for the forecast lifecycle: executor latency, step and
//! import outcomes, rotations and daily resets. Structured logging is done
//! inline with `tracing` at the call sites.

use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};
use std::sync::OnceLock;

/// Histogram buckets for executor invocations (in seconds). The external
/// process is slow: one step routinely takes tens of seconds.
const EXECUTOR_LATENCY_BUCKETS: &[f64] =
    &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    executor_latency_seconds: Histogram,
    steps_completed: IntCounter,
    steps_failed: IntCounter,
    rows_imported: IntCounter,
    rows_skipped: IntCounter,
    files_failed: IntCounter,
    points_promoted: IntCounter,
    daily_resets: IntCounter,
    runs_rejected: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            executor_latency_seconds: register_histogram!(
                "forecast_executor_latency_seconds",
                "Time spent in one external forecast invocation",
                EXECUTOR_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register executor_latency_seconds"),

            steps_completed: register_int_counter!(
                "forecast_steps_completed_total",
                "Rolling-forecast steps that imported and promoted successfully"
            )
            .expect("Failed to register steps_completed_total"),

            steps_failed: register_int_counter!(
                "forecast_steps_failed_total",
                "Rolling-forecast steps that failed or produced no output"
            )
            .expect("Failed to register steps_failed_total"),

            rows_imported: register_int_counter!(
                "forecast_rows_imported_total",
                "Prediction rows merged into the store"
            )
            .expect("Failed to register rows_imported_total"),

            rows_skipped: register_int_counter!(
                "forecast_rows_skipped_total",
                "Forecast output rows dropped during parsing"
            )
            .expect("Failed to register rows_skipped_total"),

            files_failed: register_int_counter!(
                "forecast_files_failed_total",
                "Forecast output files that failed as a whole"
            )
            .expect("Failed to register files_failed_total"),

            points_promoted: register_int_counter!(
                "forecast_points_promoted_total",
                "Prediction points rotated into the historical window"
            )
            .expect("Failed to register points_promoted_total"),

            daily_resets: register_int_counter!(
                "forecast_daily_resets_total",
                "Per-user daily resets applied"
            )
            .expect("Failed to register daily_resets_total"),

            runs_rejected: register_int_counter!(
                "forecast_runs_rejected_total",
                "Forecast runs rejected because one was already in flight"
            )
            .expect("Failed to register runs_rejected_total"),
        }
    }
}

/// Lightweight handle to the global metrics instance. Multiple clones share
/// the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_executor_latency(&self, duration_secs: f64) {
        self.inner().executor_latency_seconds.observe(duration_secs);
    }

    pub fn inc_steps_completed(&self) {
        self.inner().steps_completed.inc();
    }

    pub fn inc_steps_failed(&self) {
        self.inner().steps_failed.inc();
    }

    pub fn add_rows_imported(&self, count: u64) {
        self.inner().rows_imported.inc_by(count);
    }

    pub fn add_rows_skipped(&self, count: u64) {
        self.inner().rows_skipped.inc_by(count);
    }

    pub fn add_files_failed(&self, count: u64) {
        self.inner().files_failed.inc_by(count);
    }

    pub fn add_points_promoted(&self, count: u64) {
        self.inner().points_promoted.inc_by(count);
    }

    pub fn inc_daily_resets(&self) {
        self.inner().daily_resets.inc();
    }

    pub fn inc_runs_rejected(&self) {
        self.inner().runs_rejected.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        // Metrics register against the global Prometheus registry, so this
        // only checks that observations go through.
        let metrics = EngineMetrics::new();
        metrics.observe_executor_latency(12.5);
        metrics.inc_steps_completed();
        metrics.inc_steps_failed();
        metrics.add_rows_imported(240);
        metrics.add_rows_skipped(1);
        metrics.add_files_failed(1);
        metrics.add_points_promoted(240);
        metrics.inc_daily_resets();
        metrics.inc_runs_rejected();
    }
}
