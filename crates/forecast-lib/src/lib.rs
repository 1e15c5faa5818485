//! Forecast lifecycle and reconciliation engine
//!
//! This crate provides the core functionality for:
//! - Per-user CPU/memory usage forecasting via an external model process
//! - Sequence-indexed merging of per-metric forecast outputs
//! - Rolling history rotation between forecast steps
//! - Daily baseline resets
//! - Advisory capacity estimation from merged forecasts

pub mod capacity;
pub mod engine;
pub mod error;
pub mod executor;
pub mod merger;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod rotator;
pub mod store;

pub use capacity::{CapacityEstimator, CapacityRecommendation, CapacityThresholds};
pub use engine::{DailyResetReport, ForecastEngine};
pub use error::{ForecastError, Result};
pub use executor::{ExecutorConfig, ExecutorDiagnostics, ForecastExecutor, ProcessExecutor};
pub use merger::{ImportOutcome, ReconciliationMerger};
pub use models::*;
pub use observability::EngineMetrics;
pub use orchestrator::{ForecastRunSummary, OrchestratorConfig, StepOrchestrator, StepOutcome};
pub use rotator::{HistoryRotator, ResetStats};
pub use store::{DataAndPredictions, MergeRow, PromotionStats, TimeSeriesStore};
