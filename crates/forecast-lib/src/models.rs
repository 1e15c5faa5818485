//! Core data models for the forecast engine

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Prediction series identifier, named after the model that produced it.
/// CPU and memory land on the same row; the type is not the metric.
pub const DEFAULT_PREDICTION_TYPE: &str = "xgboost";

/// Header of the historical snapshot exported to the forecaster.
pub const SNAPSHOT_HEADER: &str = "time_dt,average_usage_cpu,average_usage_memory,user";

/// Timestamp format used in snapshot exports and forecast output files.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A forecastable user; owns all series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// One point of the rolling ground-truth window. Times are Unix seconds UTC,
/// unique per (user, time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub user_id: i64,
    pub time: i64,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

/// One merged forecast point. `sequence_idx` is a monotonic position
/// independent of wall-clock time; step K of a run occupies
/// `[(K-1)*block_size, K*block_size)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub user_id: i64,
    pub prediction_type: String,
    pub sequence_idx: i64,
    pub time: Option<i64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

/// A (time, cpu, memory) sample used when importing baseline history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesSample {
    pub time: i64,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

/// The two forecasted metrics. The external executor writes each through a
/// separate file, so they arrive independently and get coalesced on merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Cpu,
    Memory,
}

impl Metric {
    /// Column name used in snapshot exports and forecast output headers.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::Cpu => "average_usage_cpu",
            Metric::Memory => "average_usage_memory",
        }
    }

    /// Resolve a metric from a CSV header column.
    pub fn from_column(name: &str) -> Option<Self> {
        match name.trim() {
            "average_usage_cpu" | "cpu" => Some(Metric::Cpu),
            "average_usage_memory" | "memory" => Some(Metric::Memory),
            _ => None,
        }
    }

    /// Resolve a metric from a forecast output file name
    /// (`{prefix}_{metric_column}.csv`).
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.contains("memory") {
            Some(Metric::Memory)
        } else if name.contains("cpu") {
            Some(Metric::Cpu)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cpu => write!(f, "cpu"),
            Metric::Memory => write!(f, "memory"),
        }
    }
}

/// Format a Unix timestamp as `YYYY-MM-DD HH:mm:ss` UTC.
pub fn format_time(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Parse a `time_dt` field into Unix seconds. Accepts RFC 3339 as well as
/// the naive formats the forecaster emits; naive times are taken as UTC.
pub fn parse_time_dt(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    for fmt in [TIME_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc().timestamp());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_round_trip() {
        let ts = 1_700_000_000;
        let formatted = format_time(ts);
        assert_eq!(parse_time_dt(&formatted), Some(ts));
    }

    #[test]
    fn test_parse_time_dt_variants() {
        assert_eq!(
            parse_time_dt("2023-11-14 22:13:20"),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_time_dt("2023-11-14T22:13:20"),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_time_dt("2023-11-14T22:13:20+00:00"),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_time_dt("2023-11-14 22:13:20.500"),
            Some(1_700_000_000)
        );
        assert_eq!(parse_time_dt("not-a-time"), None);
        assert_eq!(parse_time_dt(""), None);
    }

    #[test]
    fn test_metric_from_column() {
        assert_eq!(Metric::from_column("average_usage_cpu"), Some(Metric::Cpu));
        assert_eq!(
            Metric::from_column(" average_usage_memory "),
            Some(Metric::Memory)
        );
        assert_eq!(Metric::from_column("time_dt"), None);
    }

    #[test]
    fn test_metric_from_file_name() {
        assert_eq!(
            Metric::from_file_name("step1_user3_1700000000_average_usage_cpu.csv"),
            Some(Metric::Cpu)
        );
        assert_eq!(
            Metric::from_file_name("step2_user3_1700000000_average_usage_memory.csv"),
            Some(Metric::Memory)
        );
        assert_eq!(Metric::from_file_name("step1_user3_result.csv"), None);
    }
}
