//! Durable time-series storage
//!
//! SQLite-backed store for historical points, the immutable baseline and
//! merged prediction points. Every mutation the lifecycle treats as atomic
//! (one import batch, one promotion, one reset half) runs inside a single
//! transaction. No rows are cached across calls; every operation re-reads
//! the store so a process restart mid-sequence loses nothing.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::Result;
use crate::models::{HistoricalPoint, Metric, PredictionPoint, SeriesSample, User};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS historical_points (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    time INTEGER NOT NULL,
    cpu REAL,
    memory REAL,
    UNIQUE (user_id, time)
);

CREATE TABLE IF NOT EXISTS original_historical_points (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    time INTEGER NOT NULL,
    cpu REAL,
    memory REAL,
    UNIQUE (user_id, time)
);

CREATE TABLE IF NOT EXISTS prediction_points (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    prediction_type TEXT NOT NULL,
    sequence_idx INTEGER NOT NULL,
    time INTEGER,
    cpu REAL,
    memory REAL,
    UNIQUE (user_id, prediction_type, sequence_idx),
    UNIQUE (user_id, prediction_type, time)
);
";

/// One metric value destined for a prediction row, keyed by sequence index.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRow {
    pub user_id: i64,
    pub sequence_idx: i64,
    pub time: Option<i64>,
    pub value: f64,
}

/// Outcome of one promotion: how many forecast rows entered history and how
/// many of the oldest historical rows made room for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionStats {
    pub promoted: usize,
    pub removed: usize,
}

/// Read-only bundle served to delivery layers.
#[derive(Debug, Clone)]
pub struct DataAndPredictions {
    /// Most recent historical points, in chronological order.
    pub historical: Vec<HistoricalPoint>,
    /// Most recent predictions, in ascending sequence order.
    pub predictions: Vec<PredictionPoint>,
    /// Unix timestamp at query time.
    pub current_time: i64,
}

/// SQLite-backed store for all per-user series.
pub struct TimeSeriesStore {
    conn: Mutex<Connection>,
}

impl TimeSeriesStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store. Used by tests and scratch runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a user by name, creating it if unseen.
    pub fn ensure_user(&self, username: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            params![username],
        )?;
        let id = conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn user(&self, user_id: i64) -> Result<Option<User>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                params![user_id],
                |r| {
                    Ok(User {
                        id: r.get(0)?,
                        username: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, username FROM users ORDER BY id ASC")?;
        let users = stmt
            .query_map([], |r| {
                Ok(User {
                    id: r.get(0)?,
                    username: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Seed both the rolling window and the immutable baseline for a user.
    /// Duplicate timestamps in the input collapse onto the first occurrence.
    pub fn import_baseline(&self, user_id: i64, samples: &[SeriesSample]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for s in samples {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO historical_points (user_id, time, cpu, memory)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, s.time, s.cpu, s.memory],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO original_historical_points (user_id, time, cpu, memory)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, s.time, s.cpu, s.memory],
            )?;
        }
        tx.commit()?;
        debug!(user_id, inserted, "baseline imported");
        Ok(inserted)
    }

    /// The user's rolling window, time ascending.
    pub fn historical_points(&self, user_id: i64) -> Result<Vec<HistoricalPoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, time, cpu, memory FROM historical_points
             WHERE user_id = ?1 ORDER BY time ASC",
        )?;
        let points = stmt
            .query_map(params![user_id], row_to_historical)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    pub fn historical_count(&self, user_id: i64) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM historical_points WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn baseline_count(&self, user_id: i64) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM original_historical_points WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn prediction_count(&self, user_id: i64, prediction_type: &str) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM prediction_points
             WHERE user_id = ?1 AND prediction_type = ?2",
            params![user_id, prediction_type],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// All sequence indexes for a series, ascending. Gaps signal failed steps.
    pub fn sequence_indexes(&self, user_id: i64, prediction_type: &str) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence_idx FROM prediction_points
             WHERE user_id = ?1 AND prediction_type = ?2 ORDER BY sequence_idx ASC",
        )?;
        let idxs = stmt
            .query_map(params![user_id, prediction_type], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(idxs)
    }

    /// Merge one import batch (one file's rows) in a single transaction.
    ///
    /// The upsert discipline is merge-not-overwrite, spelled out as an
    /// explicit read-existing, compute-merged, write sequence:
    /// - no row at (user, type, seq): insert with only this metric set;
    /// - row exists: set this metric, keep the sibling metric untouched, and
    ///   never let a NULL time overwrite a set time;
    /// - no row at the sequence key but one at (user, type, time): coalesce
    ///   into that row, so a drifted ordinal still lands on the same instant.
    pub fn merge_prediction_rows(
        &self,
        prediction_type: &str,
        metric: Metric,
        rows: &[MergeRow],
    ) -> Result<usize> {
        let col = match metric {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
        };
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for row in rows {
            let existing: Option<(i64, Option<i64>)> = tx
                .query_row(
                    "SELECT id, time FROM prediction_points
                     WHERE user_id = ?1 AND prediction_type = ?2 AND sequence_idx = ?3",
                    params![row.user_id, prediction_type, row.sequence_idx],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, current_time)) => {
                    let time = current_time.or(row.time);
                    tx.execute(
                        &format!("UPDATE prediction_points SET {col} = ?1, time = ?2 WHERE id = ?3"),
                        params![row.value, time, id],
                    )?;
                }
                None => {
                    let by_time: Option<i64> = match row.time {
                        Some(t) => tx
                            .query_row(
                                "SELECT id FROM prediction_points
                                 WHERE user_id = ?1 AND prediction_type = ?2 AND time = ?3",
                                params![row.user_id, prediction_type, t],
                                |r| r.get(0),
                            )
                            .optional()?,
                        None => None,
                    };
                    match by_time {
                        Some(id) => {
                            tx.execute(
                                &format!("UPDATE prediction_points SET {col} = ?1 WHERE id = ?2"),
                                params![row.value, id],
                            )?;
                        }
                        None => {
                            let (cpu, memory) = match metric {
                                Metric::Cpu => (Some(row.value), None),
                                Metric::Memory => (None, Some(row.value)),
                            };
                            tx.execute(
                                "INSERT INTO prediction_points
                                 (user_id, prediction_type, sequence_idx, time, cpu, memory)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                                params![
                                    row.user_id,
                                    prediction_type,
                                    row.sequence_idx,
                                    row.time,
                                    cpu,
                                    memory
                                ],
                            )?;
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Slide one forecast block into the rolling window, atomically.
    ///
    /// Takes the `count` earliest-by-sequence prediction rows not yet
    /// represented in history (time strictly greater than the current history
    /// maximum), deletes the same number of oldest historical rows and
    /// inserts the promoted rows. The window size never changes.
    pub fn promote_into_history(
        &self,
        user_id: i64,
        prediction_type: &str,
        count: usize,
    ) -> Result<PromotionStats> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let max_time: Option<i64> = tx.query_row(
            "SELECT MAX(time) FROM historical_points WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        let floor = max_time.unwrap_or(i64::MIN);

        let rows: Vec<(i64, Option<f64>, Option<f64>)> = {
            let mut stmt = tx.prepare(
                "SELECT time, cpu, memory FROM prediction_points
                 WHERE user_id = ?1 AND prediction_type = ?2
                   AND time IS NOT NULL AND time > ?3
                 ORDER BY sequence_idx ASC LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![user_id, prediction_type, floor, count as i64],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let removed = tx.execute(
            "DELETE FROM historical_points WHERE id IN (
                 SELECT id FROM historical_points WHERE user_id = ?1
                 ORDER BY time ASC LIMIT ?2
             )",
            params![user_id, rows.len() as i64],
        )?;
        for (time, cpu, memory) in &rows {
            tx.execute(
                "INSERT OR IGNORE INTO historical_points (user_id, time, cpu, memory)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, time, cpu, memory],
            )?;
        }
        tx.commit()?;

        Ok(PromotionStats {
            promoted: rows.len(),
            removed,
        })
    }

    /// Delete all prediction rows for a user. First half of the daily reset.
    pub fn clear_predictions(&self, user_id: i64) -> Result<usize> {
        let conn = self.lock();
        let cleared = conn.execute(
            "DELETE FROM prediction_points WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(cleared)
    }

    /// Replace the rolling window with the exact immutable baseline, in
    /// timestamp order. Second half of the daily reset.
    pub fn restore_baseline(&self, user_id: i64) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM historical_points WHERE user_id = ?1",
            params![user_id],
        )?;
        let restored = tx.execute(
            "INSERT INTO historical_points (user_id, time, cpu, memory)
             SELECT user_id, time, cpu, memory FROM original_historical_points
             WHERE user_id = ?1 ORDER BY time ASC",
            params![user_id],
        )?;
        tx.commit()?;
        Ok(restored)
    }

    /// The most recent `limit` predictions carrying the given metric,
    /// returned in ascending sequence order.
    pub fn latest_predictions(
        &self,
        user_id: i64,
        prediction_type: &str,
        metric: Metric,
        limit: usize,
    ) -> Result<Vec<PredictionPoint>> {
        let col = match metric {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
        };
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT user_id, prediction_type, sequence_idx, time, cpu, memory
             FROM prediction_points
             WHERE user_id = ?1 AND prediction_type = ?2 AND {col} IS NOT NULL
             ORDER BY sequence_idx DESC LIMIT ?3"
        ))?;
        let mut points = stmt
            .query_map(params![user_id, prediction_type, limit as i64], row_to_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        points.reverse();
        Ok(points)
    }

    /// Combined read for delivery layers: recent history in chronological
    /// order plus recent predictions in sequence order.
    pub fn data_and_predictions(
        &self,
        user_id: i64,
        prediction_type: &str,
        metric: Metric,
        history_limit: usize,
        prediction_limit: usize,
    ) -> Result<DataAndPredictions> {
        let historical = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT user_id, time, cpu, memory FROM historical_points
                 WHERE user_id = ?1 ORDER BY time DESC LIMIT ?2",
            )?;
            let mut points = stmt
                .query_map(params![user_id, history_limit as i64], row_to_historical)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            points.reverse();
            points
        };
        let predictions =
            self.latest_predictions(user_id, prediction_type, metric, prediction_limit)?;
        Ok(DataAndPredictions {
            historical,
            predictions,
            current_time: chrono::Utc::now().timestamp(),
        })
    }
}

fn row_to_historical(row: &Row<'_>) -> rusqlite::Result<HistoricalPoint> {
    Ok(HistoricalPoint {
        user_id: row.get(0)?,
        time: row.get(1)?,
        cpu: row.get(2)?,
        memory: row.get(3)?,
    })
}

fn row_to_prediction(row: &Row<'_>) -> rusqlite::Result<PredictionPoint> {
    Ok(PredictionPoint {
        user_id: row.get(0)?,
        prediction_type: row.get(1)?,
        sequence_idx: row.get(2)?,
        time: row.get(3)?,
        cpu: row.get(4)?,
        memory: row.get(5)?,
    })
}
