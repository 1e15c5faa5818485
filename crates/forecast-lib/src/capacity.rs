//! Capacity estimation from merged forecasts
//!
//! Derives an advisory instance-count recommendation from the latest CPU
//! predictions. Applying it to real infrastructure is somebody else's job;
//! callers must check `used_defaults` before treating a value as
//! authoritative.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};
use crate::models::Metric;
use crate::store::TimeSeriesStore;

/// Default lookahead window: 80 points, roughly four hours at the 3-minute
/// sampling cadence.
pub const DEFAULT_CAPACITY_WINDOW: usize = 80;

/// Tunable thresholds for a recommendation.
#[derive(Debug, Clone)]
pub struct CapacityThresholds {
    /// Headroom applied on top of the predicted peak, in percent.
    pub buffer_percent: f64,
    /// CPU each instance is expected to absorb, in the same unit as the
    /// forecast values.
    pub per_instance_cpu_target: f64,
    pub min_instances: u32,
    pub max_instances: u32,
    /// How many of the most recent predictions to consider.
    pub window: usize,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            buffer_percent: 20.0,
            per_instance_cpu_target: 0.5,
            min_instances: 1,
            max_instances: 10,
            window: DEFAULT_CAPACITY_WINDOW,
        }
    }
}

impl CapacityThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_percent < 0.0 {
            return Err(ForecastError::InvalidThresholds(
                "buffer_percent must be non-negative".into(),
            ));
        }
        if self.per_instance_cpu_target <= 0.0 {
            return Err(ForecastError::InvalidThresholds(
                "per_instance_cpu_target must be positive".into(),
            ));
        }
        if self.min_instances > self.max_instances {
            return Err(ForecastError::InvalidThresholds(
                "min_instances must not exceed max_instances".into(),
            ));
        }
        if self.window == 0 {
            return Err(ForecastError::InvalidThresholds(
                "window must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Advisory recommendation derived from the latest merged forecasts.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityRecommendation {
    /// The raw ceiling the math asks for, before clamping.
    pub recommended_instances: u32,
    /// The clamped value a deployer would act on.
    pub applied_instances: u32,
    pub peak_predicted: f64,
    pub avg_predicted: f64,
    /// True when no predictions existed and the floor was returned.
    pub used_defaults: bool,
}

/// Reads the latest merged forecasts and derives instance counts.
pub struct CapacityEstimator {
    store: Arc<TimeSeriesStore>,
}

impl CapacityEstimator {
    pub fn new(store: Arc<TimeSeriesStore>) -> Self {
        Self { store }
    }

    pub fn recommend(
        &self,
        user_id: i64,
        prediction_type: &str,
        thresholds: &CapacityThresholds,
    ) -> Result<CapacityRecommendation> {
        thresholds.validate()?;

        let points =
            self.store
                .latest_predictions(user_id, prediction_type, Metric::Cpu, thresholds.window)?;
        let values: Vec<f64> = points.iter().filter_map(|p| p.cpu).collect();

        if values.is_empty() {
            warn!(
                user_id,
                prediction_type, "no predictions available, returning default recommendation"
            );
            return Ok(CapacityRecommendation {
                recommended_instances: thresholds.min_instances,
                applied_instances: thresholds.min_instances,
                peak_predicted: 0.0,
                avg_predicted: 0.0,
                used_defaults: true,
            });
        }

        let peak = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        let peak_with_buffer = peak * (1.0 + thresholds.buffer_percent / 100.0);
        let raw = (peak_with_buffer / thresholds.per_instance_cpu_target).ceil();
        let recommended = if raw.is_finite() && raw > 0.0 {
            raw as u32
        } else {
            0
        };
        let applied = recommended.clamp(thresholds.min_instances, thresholds.max_instances);

        debug!(
            user_id,
            peak_predicted = peak,
            avg_predicted = avg,
            recommended_instances = recommended,
            applied_instances = applied,
            "capacity recommendation computed"
        );
        Ok(CapacityRecommendation {
            recommended_instances: recommended,
            applied_instances: applied,
            peak_predicted: peak,
            avg_predicted: avg,
            used_defaults: false,
        })
    }
}
