//! Sensor reading persistence.
//!
//! Readings are immutable once written; the only mutations on this table
//! are retention deletes. Queries return newest-first, capped results.

use chrono::{DateTime, Utc};
use mowos_types::SensorReading;
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Hard cap on a single query, regardless of the requested limit.
const MAX_QUERY_LIMIT: u32 = 1_000;

/// Default limit when the caller does not specify one.
const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Filters for [`ReadingStore::query`]. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub sensor_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ReadingFilter {
    /// Everything recorded by one sensor.
    pub fn for_sensor(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: Some(sensor_id.into()),
            ..Self::default()
        }
    }

    fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

/// CRUD operations on the `sensor_readings` table.
#[derive(Clone)]
pub struct ReadingStore {
    db: Database,
}

impl ReadingStore {
    /// Create a reading store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a reading, returning its row id.
    #[instrument(skip(self, reading), fields(sensor_id = %reading.sensor_id))]
    pub async fn insert(&self, reading: &SensorReading) -> StoreResult<i64> {
        let sensor_id = reading.sensor_id.clone();
        let sensor_type = reading.sensor_type.clone();
        let timestamp = reading.timestamp.timestamp_millis();
        let value_json = serde_json::to_string(&reading.value)?;
        let unit = reading.unit.clone();
        let quality = reading.quality;
        let metadata_json = serde_json::to_string(&reading.metadata)?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO sensor_readings (sensor_id, sensor_type, timestamp, value_json, unit, quality, metadata_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        sensor_id,
                        sensor_type,
                        timestamp,
                        value_json,
                        unit,
                        quality,
                        metadata_json
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Query readings matching `filter`, newest first.
    ///
    /// The limit is capped server-side so a runaway caller cannot pull the
    /// whole table into memory.
    #[instrument(skip(self))]
    pub async fn query(&self, filter: ReadingFilter) -> StoreResult<Vec<SensorReading>> {
        let limit = filter.effective_limit();
        self.db
            .execute(move |conn| {
                let mut sql = String::from(
                    "SELECT sensor_id, sensor_type, timestamp, value_json, unit, quality, metadata_json \
                     FROM sensor_readings WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

                if let Some(sensor_id) = filter.sensor_id {
                    params.push(Box::new(sensor_id));
                    sql.push_str(&format!(" AND sensor_id = ?{}", params.len()));
                }
                if let Some(sensor_type) = filter.sensor_type {
                    params.push(Box::new(sensor_type));
                    sql.push_str(&format!(" AND sensor_type = ?{}", params.len()));
                }
                if let Some(start) = filter.start {
                    params.push(Box::new(start.timestamp_millis()));
                    sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
                }
                if let Some(end) = filter.end {
                    params.push(Box::new(end.timestamp_millis()));
                    sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
                }

                params.push(Box::new(limit));
                sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT ?{}", params.len()));

                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut readings = Vec::with_capacity(rows.len());
                for (sensor_id, sensor_type, ts, value_json, unit, quality, metadata_json) in rows {
                    readings.push(SensorReading {
                        sensor_id,
                        sensor_type,
                        timestamp: DateTime::from_timestamp_millis(ts).ok_or_else(|| {
                            StoreError::InvalidArgument(format!("bad timestamp in row: {ts}"))
                        })?,
                        value: serde_json::from_str(&value_json)?,
                        unit,
                        quality,
                        metadata: serde_json::from_str(&metadata_json)?,
                    });
                }
                Ok(readings)
            })
            .await
    }

    /// Total number of stored readings.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let count: i64 =
                    conn.query_row("SELECT count(*) FROM sensor_readings", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> ReadingStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        ReadingStore::new(db)
    }

    fn reading(sensor_id: &str, sensor_type: &str, value: serde_json::Value) -> SensorReading {
        SensorReading::new(sensor_id, sensor_type, value, "V", 0.95).unwrap()
    }

    #[tokio::test]
    async fn insert_and_query_roundtrip() {
        let store = setup().await;
        let r = reading("battery_main", "battery", serde_json::json!({"voltage": 12.6}));
        store.insert(&r).await.unwrap();

        let results = store
            .query(ReadingFilter::for_sensor("battery_main"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sensor_id, "battery_main");
        assert_eq!(results[0].value["voltage"], serde_json::json!(12.6));
        assert!((results[0].quality - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn query_filters_by_sensor_type() {
        let store = setup().await;
        store
            .insert(&reading("battery_main", "battery", serde_json::json!(12.6)))
            .await
            .unwrap();
        store
            .insert(&reading("gps_1", "navigation", serde_json::json!({"lat": 1.0})))
            .await
            .unwrap();

        let results = store
            .query(ReadingFilter {
                sensor_type: Some("navigation".into()),
                ..ReadingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sensor_id, "gps_1");
    }

    #[tokio::test]
    async fn query_returns_newest_first() {
        let store = setup().await;
        let mut old = reading("s1", "battery", serde_json::json!(1));
        old.timestamp = Utc::now() - chrono::Duration::seconds(60);
        let new = reading("s1", "battery", serde_json::json!(2));

        store.insert(&old).await.unwrap();
        store.insert(&new).await.unwrap();

        let results = store.query(ReadingFilter::for_sensor("s1")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].value, serde_json::json!(2));
        assert_eq!(results[1].value, serde_json::json!(1));
    }

    #[tokio::test]
    async fn query_respects_time_window() {
        let store = setup().await;
        let mut ancient = reading("s1", "battery", serde_json::json!("old"));
        ancient.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.insert(&ancient).await.unwrap();
        store
            .insert(&reading("s1", "battery", serde_json::json!("fresh")))
            .await
            .unwrap();

        let results = store
            .query(ReadingFilter {
                sensor_id: Some("s1".into()),
                start: Some(Utc::now() - chrono::Duration::minutes(30)),
                ..ReadingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, serde_json::json!("fresh"));
    }

    #[tokio::test]
    async fn limit_is_capped() {
        let filter = ReadingFilter {
            limit: Some(1_000_000),
            ..ReadingFilter::default()
        };
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);

        let store = setup().await;
        for i in 0..5 {
            store
                .insert(&reading("s1", "battery", serde_json::json!(i)))
                .await
                .unwrap();
        }
        let results = store
            .query(ReadingFilter {
                sensor_id: Some("s1".into()),
                limit: Some(3),
                ..ReadingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn count_tracks_inserts() {
        let store = setup().await;
        assert_eq!(store.count().await.unwrap(), 0);
        store
            .insert(&reading("s1", "battery", serde_json::json!(1)))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
