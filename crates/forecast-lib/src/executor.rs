//! External forecasting model invocation
//!
//! The forecasting model is a black-box process: it consumes a historical
//! snapshot and writes per-metric forecast files named
//! `{prefix}_{metric_column}.csv`. This module owns the process seam and the
//! stdout diagnostics scrape; parsing the output files belongs to the merger.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};

/// Default wall-clock budget for one executor invocation. The process has no
/// built-in timeout, so expiry is treated as a step failure.
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(300);

/// Diagnostics scraped from the executor's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorDiagnostics {
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub r2: Option<f64>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub saved_outputs: Vec<PathBuf>,
}

impl ExecutorDiagnostics {
    /// Scrape the known diagnostic lines from executor stdout. Anything else
    /// is ignored.
    pub fn from_stdout(stdout: &str) -> Self {
        let mut diag = Self::default();
        for line in stdout.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("RMSE:") {
                diag.rmse = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("MAE:") {
                diag.mae = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("R²:") {
                diag.r2 = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("Warning:") {
                diag.warnings.push(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("Error:") {
                diag.errors.push(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("Future predictions saved to") {
                diag.saved_outputs.push(PathBuf::from(rest.trim()));
            }
        }
        diag
    }
}

/// Trait for forecast executor implementations. Tests substitute a scripted
/// implementation that writes output files directly.
#[async_trait]
pub trait ForecastExecutor: Send + Sync {
    /// Run one forecast step: consume the snapshot at `input` and write
    /// per-metric output files under `output_dir` using `prefix`.
    async fn execute(
        &self,
        input: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<ExecutorDiagnostics>;
}

/// Configuration for the out-of-process executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// The forecasting program to spawn.
    pub program: PathBuf,
    /// Directory holding the trained model artifacts, passed through as the
    /// fourth positional argument.
    pub model_dir: PathBuf,
    /// Invocation timeout; expiry fails the step.
    pub timeout: Duration,
}

/// Production executor: spawns the forecasting program with the positional
/// args `(input, output_dir, prefix, model_dir)` and scrapes its stdout.
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ForecastExecutor for ProcessExecutor {
    async fn execute(
        &self,
        input: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<ExecutorDiagnostics> {
        debug!(
            program = %self.config.program.display(),
            input = %input.display(),
            prefix = %prefix,
            "invoking forecast executor"
        );

        let output = tokio::time::timeout(
            self.config.timeout,
            Command::new(&self.config.program)
                .arg(input)
                .arg(output_dir)
                .arg(prefix)
                .arg(&self.config.model_dir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ForecastError::ExecutorFailure {
            reason: format!("timed out after {:?}", self.config.timeout),
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForecastError::ExecutorFailure {
                reason: format!(
                    "exit status {}: {}",
                    output.status,
                    stderr.lines().last().unwrap_or("").trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let diag = ExecutorDiagnostics::from_stdout(&stdout);
        for w in &diag.warnings {
            warn!(warning = %w, "executor warning");
        }
        for e in &diag.errors {
            warn!(error = %e, "executor reported error");
        }
        debug!(rmse = ?diag.rmse, mae = ?diag.mae, r2 = ?diag.r2, "executor diagnostics");
        Ok(diag)
    }
}
