//! Retention-driven cleanup.
//!
//! Each table has its own retention horizon; cleanup deletes rows strictly
//! older than the horizon and never touches anything within it. After a
//! sweep the WAL is checkpointed, and once enough rows have been removed a
//! full VACUUM reclaims the file space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Cumulative deleted rows that trigger a VACUUM.
const VACUUM_THRESHOLD: u64 = 10_000;

/// Per-table retention horizons, in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub readings_days: u32,
    pub states_days: u32,
    pub metrics_days: u32,
    pub logs_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            readings_days: 30,
            states_days: 7,
            metrics_days: 90,
            logs_days: 60,
        }
    }
}

impl RetentionPolicy {
    /// Reject horizons that cannot be enforced. A zero horizon would make
    /// every row immediately eligible and is always a misconfiguration.
    pub fn validate(&self) -> StoreResult<()> {
        for (name, days) in [
            ("readings_days", self.readings_days),
            ("states_days", self.states_days),
            ("metrics_days", self.metrics_days),
            ("logs_days", self.logs_days),
        ] {
            if days == 0 {
                return Err(StoreError::InvalidRetention(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub readings_deleted: usize,
    pub states_deleted: usize,
    pub metrics_deleted: usize,
    pub logs_deleted: usize,
    pub vacuumed: bool,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.readings_deleted + self.states_deleted + self.metrics_deleted + self.logs_deleted
    }
}

/// Owns the retention policy and the vacuum bookkeeping.
#[derive(Clone)]
pub struct RetentionManager {
    db: Database,
    policy: RetentionPolicy,
    deleted_since_vacuum: Arc<AtomicU64>,
}

impl RetentionManager {
    /// Create a manager; fails fast on an unenforceable policy.
    pub fn new(db: Database, policy: RetentionPolicy) -> StoreResult<Self> {
        policy.validate()?;
        Ok(Self {
            db,
            policy,
            deleted_since_vacuum: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Delete rows older than each table's horizon.
    ///
    /// Cutoffs are computed once, up front, so a slow sweep can never creep
    /// past the horizon it started with.
    #[instrument(skip(self))]
    pub async fn cleanup_old_data(&self) -> StoreResult<CleanupReport> {
        let now = Utc::now();
        let readings_cutoff = (now - Duration::days(i64::from(self.policy.readings_days)))
            .timestamp_millis();
        let states_cutoff =
            (now - Duration::days(i64::from(self.policy.states_days))).timestamp_millis();
        let metrics_cutoff =
            (now - Duration::days(i64::from(self.policy.metrics_days))).timestamp_millis();
        let logs_cutoff =
            (now - Duration::days(i64::from(self.policy.logs_days))).timestamp_millis();

        let mut report = self
            .db
            .execute(move |conn| {
                let readings_deleted = conn.execute(
                    "DELETE FROM sensor_readings WHERE timestamp < ?1",
                    [readings_cutoff],
                )?;
                let states_deleted = conn.execute(
                    "DELETE FROM operational_states WHERE last_update < ?1",
                    [states_cutoff],
                )?;
                let metrics_deleted = conn.execute(
                    "DELETE FROM performance_metrics WHERE timestamp < ?1",
                    [metrics_cutoff],
                )?;
                let logs_deleted = conn.execute(
                    "DELETE FROM operational_logs WHERE timestamp < ?1",
                    [logs_cutoff],
                )?;

                // Fold the WAL back into the main file while we are already
                // holding the write path. The pragma returns a status row.
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

                Ok(CleanupReport {
                    readings_deleted,
                    states_deleted,
                    metrics_deleted,
                    logs_deleted,
                    vacuumed: false,
                })
            })
            .await?;

        let total = self
            .deleted_since_vacuum
            .fetch_add(report.total_deleted() as u64, Ordering::Relaxed)
            + report.total_deleted() as u64;

        if total >= VACUUM_THRESHOLD {
            match self.db.execute(|conn| {
                conn.execute_batch("VACUUM;")?;
                Ok(())
            })
            .await
            {
                Ok(()) => {
                    self.deleted_since_vacuum.store(0, Ordering::Relaxed);
                    report.vacuumed = true;
                    info!("database vacuumed after retention cleanup");
                }
                Err(err) => {
                    // Not fatal — space is reclaimed on the next pass.
                    warn!(%err, "vacuum after cleanup failed");
                }
            }
        }

        if report.total_deleted() > 0 {
            info!(
                readings = report.readings_deleted,
                states = report.states_deleted,
                metrics = report.metrics_deleted,
                logs = report.logs_deleted,
                "retention cleanup removed rows"
            );
        }
        Ok(report)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    async fn insert_reading_at(db: &Database, ts_millis: i64) {
        db.execute(move |conn| {
            conn.execute(
                "INSERT INTO sensor_readings (sensor_id, sensor_type, timestamp, value_json, unit, quality, metadata_json) \
                 VALUES ('s1', 'battery', ?1, '1.0', 'V', 1.0, '{}')",
                [ts_millis],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn zero_horizon_is_rejected() {
        let policy = RetentionPolicy {
            readings_days: 0,
            ..RetentionPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(RetentionPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn manager_rejects_bad_policy() {
        let db = setup().await;
        let policy = RetentionPolicy {
            logs_days: 0,
            ..RetentionPolicy::default()
        };
        assert!(RetentionManager::new(db, policy).is_err());
    }

    #[tokio::test]
    async fn cleanup_deletes_only_rows_past_horizon() {
        let db = setup().await;
        let now = Utc::now();

        // One row well past the 30-day readings horizon, one within it.
        insert_reading_at(&db, (now - Duration::days(31)).timestamp_millis()).await;
        insert_reading_at(&db, (now - Duration::days(29)).timestamp_millis()).await;
        insert_reading_at(&db, now.timestamp_millis()).await;

        let manager = RetentionManager::new(db.clone(), RetentionPolicy::default()).unwrap();
        let report = manager.cleanup_old_data().await.unwrap();

        assert_eq!(report.readings_deleted, 1);
        let remaining: i64 = db
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM sensor_readings", [], |row| {
                    row.get(0)
                })?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn cleanup_on_fresh_data_deletes_nothing() {
        let db = setup().await;
        insert_reading_at(&db, Utc::now().timestamp_millis()).await;

        let manager = RetentionManager::new(db, RetentionPolicy::default()).unwrap();
        let report = manager.cleanup_old_data().await.unwrap();
        assert_eq!(report.total_deleted(), 0);
        assert!(!report.vacuumed);
    }

    #[tokio::test]
    async fn cleanup_covers_every_table() {
        let db = setup().await;
        let old = (Utc::now() - Duration::days(365)).timestamp_millis();

        db.execute(move |conn| {
            conn.execute(
                "INSERT INTO operational_states (state, mode, battery_level, progress, last_update, metadata_json) \
                 VALUES ('idle', 'automatic', 0.5, 0.0, ?1, '{}')",
                [old],
            )?;
            conn.execute(
                "INSERT INTO performance_metrics (metric_name, timestamp, value, category, tags_json) \
                 VALUES ('m', ?1, 1.0, 'general', '{}')",
                [old],
            )?;
            conn.execute(
                "INSERT INTO operational_logs (timestamp, level, component, message, context_json) \
                 VALUES (?1, 'info', 'core', 'old line', '{}')",
                [old],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let manager = RetentionManager::new(db, RetentionPolicy::default()).unwrap();
        let report = manager.cleanup_old_data().await.unwrap();
        assert_eq!(report.states_deleted, 1);
        assert_eq!(report.metrics_deleted, 1);
        assert_eq!(report.logs_deleted, 1);
    }
}
