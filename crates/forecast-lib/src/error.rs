//! Error types for the forecast engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an operation. Row- and file-level import problems are
/// not represented here; they are carried in [`crate::merger::ImportOutcome`]
/// so that one bad row or file never blocks the rest of a batch.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// No historical rows exist when a run starts. Fatal for that run.
    #[error("no historical data for user {user_id}")]
    DataUnavailable { user_id: i64 },

    /// A rolling-forecast run is already in flight for this key.
    #[error("forecast run already in flight for user {user_id} ({prediction_type})")]
    RunInProgress {
        user_id: i64,
        prediction_type: String,
    },

    /// The external forecasting process failed or timed out. Aborts the
    /// current step chain; previously committed steps stand.
    #[error("forecast executor failed: {reason}")]
    ExecutorFailure { reason: String },

    /// A forecast output file could not be used at all (unreadable, missing
    /// header, undeterminable target metric). Confined to that file.
    #[error("unusable forecast output file {path}: {reason}")]
    ImportFile { path: PathBuf, reason: String },

    /// Capacity thresholds failed validation.
    #[error("invalid capacity thresholds: {0}")]
    InvalidThresholds(String),

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
