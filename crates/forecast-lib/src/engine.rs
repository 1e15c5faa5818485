//! Long-lived engine facade
//!
//! One owner for the store handles, the in-flight run registry and the
//! estimator. Exposes the forecast lifecycle as a linear sequence of fallible
//! steps, plus the read-only query surface consumed by delivery layers.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::capacity::{CapacityEstimator, CapacityRecommendation, CapacityThresholds};
use crate::error::Result;
use crate::executor::ForecastExecutor;
use crate::models::{Metric, PredictionPoint};
use crate::observability::EngineMetrics;
use crate::orchestrator::{ForecastRunSummary, OrchestratorConfig, StepOrchestrator};
use crate::rotator::HistoryRotator;
use crate::store::{DataAndPredictions, TimeSeriesStore};

/// Outcome of one scheduled reset sweep across all users.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyResetReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Owns the forecast lifecycle for every user.
pub struct ForecastEngine {
    store: Arc<TimeSeriesStore>,
    orchestrator: StepOrchestrator,
    rotator: HistoryRotator,
    estimator: CapacityEstimator,
    prediction_type: String,
    metrics: EngineMetrics,
}

impl ForecastEngine {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        executor: Arc<dyn ForecastExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let prediction_type = config.prediction_type.clone();
        Self {
            orchestrator: StepOrchestrator::new(store.clone(), executor, config),
            rotator: HistoryRotator::new(store.clone()),
            estimator: CapacityEstimator::new(store.clone()),
            store,
            prediction_type,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    /// Run a full rolling forecast for one user.
    pub async fn run_forecast(&self, user_id: i64) -> Result<ForecastRunSummary> {
        self.orchestrator.run_forecast(user_id).await
    }

    /// Reset one user to the daily baseline, then immediately re-forecast so
    /// predictions exist right after the boundary. Callable by any scheduler;
    /// the schedule itself lives outside the engine.
    pub async fn daily_reset(&self, user_id: i64) -> Result<ForecastRunSummary> {
        self.rotator.reset_user(user_id)?;
        self.metrics.inc_daily_resets();
        self.run_forecast(user_id).await
    }

    /// Apply the daily reset to every user, sequentially, with per-user error
    /// isolation: one user's failure is logged and skipped, never blocking
    /// the others.
    pub async fn daily_reset_all(&self) -> DailyResetReport {
        let users = match self.store.list_users() {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "daily reset could not list users");
                return DailyResetReport::default();
            }
        };

        let mut report = DailyResetReport {
            attempted: users.len(),
            ..DailyResetReport::default()
        };
        for user in users {
            match self.daily_reset(user.id).await {
                Ok(summary) => {
                    info!(
                        user_id = user.id,
                        username = %user.username,
                        total_predictions = summary.total_predictions,
                        "daily reset completed"
                    );
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(
                        user_id = user.id,
                        username = %user.username,
                        error = %e,
                        "daily reset failed, continuing with remaining users"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Advisory capacity recommendation from the latest merged forecasts.
    pub fn recommend(
        &self,
        user_id: i64,
        thresholds: &CapacityThresholds,
    ) -> Result<CapacityRecommendation> {
        self.estimator
            .recommend(user_id, &self.prediction_type, thresholds)
    }

    /// The most recent `limit` predictions for a metric, sequence ascending.
    pub fn latest_predictions(
        &self,
        metric: Metric,
        limit: usize,
        user_id: i64,
    ) -> Result<Vec<PredictionPoint>> {
        self.store
            .latest_predictions(user_id, &self.prediction_type, metric, limit)
    }

    /// Recent history (chronological) plus recent predictions (sequence
    /// ascending) for delivery layers.
    pub fn data_and_predictions(
        &self,
        metric: Metric,
        history_limit: usize,
        prediction_limit: usize,
        user_id: i64,
    ) -> Result<DataAndPredictions> {
        self.store.data_and_predictions(
            user_id,
            &self.prediction_type,
            metric,
            history_limit,
            prediction_limit,
        )
    }
}
