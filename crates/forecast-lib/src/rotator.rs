//! Daily history rotation
//!
//! Slides forecast blocks into the rolling ground-truth window between steps
//! (the rolling-forecast technique) and restores the immutable baseline at
//! the daily boundary.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{PromotionStats, TimeSeriesStore};

/// Outcome of one daily reset for a user.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResetStats {
    /// Prediction rows deleted.
    pub cleared_predictions: usize,
    /// Historical rows repopulated from the baseline.
    pub restored_points: usize,
}

/// Rotates forecast blocks into history and performs baseline resets.
pub struct HistoryRotator {
    store: Arc<TimeSeriesStore>,
}

impl HistoryRotator {
    pub fn new(store: Arc<TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Promote the next unpromoted forecast block into the rolling window:
    /// `count` oldest historical rows out, `count` earliest-by-sequence
    /// forecast rows in. The window size is unchanged afterwards.
    pub fn promote_step_into_history(
        &self,
        user_id: i64,
        prediction_type: &str,
        count: usize,
    ) -> Result<PromotionStats> {
        let stats = self
            .store
            .promote_into_history(user_id, prediction_type, count)?;
        if stats.promoted < count {
            warn!(
                user_id,
                prediction_type,
                promoted = stats.promoted,
                requested = count,
                "fewer forecast rows than requested were available to promote"
            );
        }
        debug!(
            user_id,
            prediction_type,
            promoted = stats.promoted,
            removed = stats.removed,
            "forecast block promoted into history"
        );
        Ok(stats)
    }

    /// Reset a user to the daily baseline: delete every prediction row, then
    /// repopulate the rolling window from the immutable baseline in timestamp
    /// order. An exact restore, not a windowed one. Each half commits in its
    /// own transaction, so a crash between them leaves the store recoverable
    /// by a re-run.
    pub fn reset_user(&self, user_id: i64) -> Result<ResetStats> {
        let cleared = self.store.clear_predictions(user_id)?;
        let restored = self.store.restore_baseline(user_id)?;
        info!(
            user_id,
            cleared_predictions = cleared,
            restored_points = restored,
            "daily reset applied"
        );
        Ok(ResetStats {
            cleared_predictions: cleared,
            restored_points: restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metric, SeriesSample, DEFAULT_PREDICTION_TYPE};
    use crate::store::MergeRow;

    fn seeded_store() -> (Arc<TimeSeriesStore>, i64) {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let user = store.ensure_user("alice").unwrap();
        let samples: Vec<SeriesSample> = (0..100)
            .map(|i| SeriesSample {
                time: 1_700_000_000 + i * 180,
                cpu: Some(0.5),
                memory: Some(100.0),
            })
            .collect();
        store.import_baseline(user, &samples).unwrap();
        (store, user)
    }

    fn merge_block(store: &TimeSeriesStore, user: i64, start_seq: i64, count: i64, start_time: i64) {
        let rows: Vec<MergeRow> = (0..count)
            .map(|i| MergeRow {
                user_id: user,
                sequence_idx: start_seq + i,
                time: Some(start_time + i * 180),
                value: 0.6,
            })
            .collect();
        store
            .merge_prediction_rows(DEFAULT_PREDICTION_TYPE, Metric::Cpu, &rows)
            .unwrap();
    }

    #[test]
    fn test_rotation_window_invariant() {
        let (store, user) = seeded_store();
        let rotator = HistoryRotator::new(store.clone());
        merge_block(&store, user, 0, 20, 1_700_000_000 + 100 * 180);

        rotator
            .promote_step_into_history(user, DEFAULT_PREDICTION_TYPE, 20)
            .unwrap();
        assert_eq!(store.historical_count(user).unwrap(), 100);
        // Oldest rows gone, newest times present.
        let points = store.historical_points(user).unwrap();
        assert_eq!(points[0].time, 1_700_000_000 + 20 * 180);
        assert_eq!(points[99].time, 1_700_000_000 + 119 * 180);
    }

    #[test]
    fn test_second_promotion_takes_next_block() {
        let (store, user) = seeded_store();
        let rotator = HistoryRotator::new(store.clone());
        merge_block(&store, user, 0, 20, 1_700_000_000 + 100 * 180);
        rotator
            .promote_step_into_history(user, DEFAULT_PREDICTION_TYPE, 20)
            .unwrap();
        merge_block(&store, user, 20, 20, 1_700_000_000 + 120 * 180);

        let stats = rotator
            .promote_step_into_history(user, DEFAULT_PREDICTION_TYPE, 20)
            .unwrap();
        // The first block is already in history; only the new block moves.
        assert_eq!(stats.promoted, 20);
        assert_eq!(store.historical_count(user).unwrap(), 100);
        let points = store.historical_points(user).unwrap();
        assert_eq!(points[99].time, 1_700_000_000 + 139 * 180);
    }

    #[test]
    fn test_reset_user_restores_exact_baseline() {
        let (store, user) = seeded_store();
        let rotator = HistoryRotator::new(store.clone());
        merge_block(&store, user, 0, 20, 1_700_000_000 + 100 * 180);
        rotator
            .promote_step_into_history(user, DEFAULT_PREDICTION_TYPE, 20)
            .unwrap();

        let stats = rotator.reset_user(user).unwrap();
        assert_eq!(stats.cleared_predictions, 20);
        assert_eq!(stats.restored_points, 100);
        assert_eq!(
            store.prediction_count(user, DEFAULT_PREDICTION_TYPE).unwrap(),
            0
        );
        let points = store.historical_points(user).unwrap();
        assert_eq!(points.len(), 100);
        assert_eq!(points[0].time, 1_700_000_000);
    }
}
