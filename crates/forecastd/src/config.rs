//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Forecasting program to spawn for each step
    #[serde(default = "default_executor_program")]
    pub executor_program: String,

    /// Directory holding the trained model artifacts
    #[serde(default = "default_model_dir")]
    pub model_dir: String,

    /// Directory for transient snapshot files
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Directory the executor writes forecast files into
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Executor timeout per invocation, in seconds
    #[serde(default = "default_executor_timeout")]
    pub executor_timeout_secs: u64,

    /// Interval between reset sweeps, in seconds
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,

    /// Label merged forecast rows carry
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
}

fn default_db_path() -> String {
    "forecast.db".to_string()
}

fn default_executor_program() -> String {
    "forecast-model".to_string()
}

fn default_model_dir() -> String {
    "models".to_string()
}

fn default_work_dir() -> String {
    "work".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_executor_timeout() -> u64 {
    300
}

fn default_reset_interval() -> u64 {
    24 * 60 * 60
}

fn default_prediction_type() -> String {
    forecast_lib::DEFAULT_PREDICTION_TYPE.to_string()
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FORECAST"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| DaemonConfig {
            db_path: default_db_path(),
            executor_program: default_executor_program(),
            model_dir: default_model_dir(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            executor_timeout_secs: default_executor_timeout(),
            reset_interval_secs: default_reset_interval(),
            prediction_type: default_prediction_type(),
        }))
    }
}
