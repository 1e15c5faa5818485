//! forecastd - Usage forecast daemon
//!
//! Runs the forecast lifecycle on a timer: every reset interval it restores
//! each user's baseline and re-runs the rolling forecast so predictions stay
//! fresh across the daily boundary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use forecast_lib::{
    ExecutorConfig, ForecastEngine, OrchestratorConfig, ProcessExecutor, TimeSeriesStore,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = DAEMON_VERSION, "Starting forecastd");

    let config = config::DaemonConfig::load()?;
    info!(
        db_path = %config.db_path,
        executor_program = %config.executor_program,
        reset_interval_secs = config.reset_interval_secs,
        "Daemon configured"
    );

    let store = Arc::new(TimeSeriesStore::open(&config.db_path)?);
    let executor = Arc::new(ProcessExecutor::new(ExecutorConfig {
        program: PathBuf::from(&config.executor_program),
        model_dir: PathBuf::from(&config.model_dir),
        timeout: Duration::from_secs(config.executor_timeout_secs),
    }));

    let mut orch_config = OrchestratorConfig::new(&config.work_dir, &config.output_dir);
    orch_config.prediction_type = config.prediction_type.clone();
    let engine = ForecastEngine::new(store, executor, orch_config);

    let mut ticker = tokio::time::interval(Duration::from_secs(config.reset_interval_secs));
    // The first tick fires immediately; skip it so startup does not trigger
    // an unscheduled reset sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!("Starting scheduled reset sweep");
                let report = engine.daily_reset_all().await;
                let summary = serde_json::to_string(&report).unwrap_or_default();
                if report.failed > 0 {
                    warn!(report = %summary, "Reset sweep finished with failures");
                } else {
                    info!(report = %summary, "Reset sweep finished");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    Ok(())
}
