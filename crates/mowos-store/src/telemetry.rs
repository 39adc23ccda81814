//! Append-only telemetry: performance metrics and operational logs.
//!
//! Both tables are retention-bound time series; nothing here updates a
//! row in place.

use chrono::{DateTime, Utc};
use mowos_types::{LogLevel, OperationalLog, PerformanceMetric};
use tracing::instrument;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Hard cap on a single telemetry query.
const MAX_QUERY_LIMIT: u32 = 1_000;

/// Filters for [`TelemetryStore::query_metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    pub metric_name: Option<String>,
    pub category: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Filters for [`TelemetryStore::query_logs`].
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub component: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Operations on `performance_metrics` and `operational_logs`.
#[derive(Clone)]
pub struct TelemetryStore {
    db: Database,
}

impl TelemetryStore {
    /// Create a telemetry store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a performance metric.
    #[instrument(skip(self, metric), fields(name = %metric.metric_name))]
    pub async fn insert_metric(&self, metric: &PerformanceMetric) -> StoreResult<i64> {
        let name = metric.metric_name.clone();
        let timestamp = metric.timestamp.timestamp_millis();
        let value = metric.value;
        let category = metric.category.clone();
        let tags_json = serde_json::to_string(&metric.tags)?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO performance_metrics (metric_name, timestamp, value, category, tags_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![name, timestamp, value, category, tags_json],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Query metrics, newest first.
    #[instrument(skip(self))]
    pub async fn query_metrics(&self, filter: MetricFilter) -> StoreResult<Vec<PerformanceMetric>> {
        let limit = filter.limit.unwrap_or(100).min(MAX_QUERY_LIMIT);
        self.db
            .execute(move |conn| {
                let mut sql = String::from(
                    "SELECT metric_name, timestamp, value, category, tags_json \
                     FROM performance_metrics WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

                if let Some(name) = filter.metric_name {
                    params.push(Box::new(name));
                    sql.push_str(&format!(" AND metric_name = ?{}", params.len()));
                }
                if let Some(category) = filter.category {
                    params.push(Box::new(category));
                    sql.push_str(&format!(" AND category = ?{}", params.len()));
                }
                if let Some(since) = filter.since {
                    params.push(Box::new(since.timestamp_millis()));
                    sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
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
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut metrics = Vec::with_capacity(rows.len());
                for (metric_name, ts, value, category, tags_json) in rows {
                    metrics.push(PerformanceMetric {
                        metric_name,
                        timestamp: DateTime::from_timestamp_millis(ts).ok_or_else(|| {
                            StoreError::InvalidArgument(format!("bad timestamp in row: {ts}"))
                        })?,
                        value,
                        category,
                        tags: serde_json::from_str(&tags_json)?,
                    });
                }
                Ok(metrics)
            })
            .await
    }

    /// Append an operational log row.
    #[instrument(skip(self, log), fields(component = %log.component, level = log.level.as_str()))]
    pub async fn insert_log(&self, log: &OperationalLog) -> StoreResult<i64> {
        let timestamp = log.timestamp.timestamp_millis();
        let level = log.level.as_str().to_string();
        let component = log.component.clone();
        let message = log.message.clone();
        let context_json = serde_json::to_string(&log.context)?;
        let correlation_id = log.correlation_id.map(|id| id.to_string());

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO operational_logs (timestamp, level, component, message, context_json, correlation_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![timestamp, level, component, message, context_json, correlation_id],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Query logs, newest first.
    #[instrument(skip(self))]
    pub async fn query_logs(&self, filter: LogFilter) -> StoreResult<Vec<OperationalLog>> {
        let limit = filter.limit.unwrap_or(100).min(MAX_QUERY_LIMIT);
        self.db
            .execute(move |conn| {
                let mut sql = String::from(
                    "SELECT timestamp, level, component, message, context_json, correlation_id \
                     FROM operational_logs WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

                if let Some(level) = filter.level {
                    params.push(Box::new(level.as_str().to_string()));
                    sql.push_str(&format!(" AND level = ?{}", params.len()));
                }
                if let Some(component) = filter.component {
                    params.push(Box::new(component));
                    sql.push_str(&format!(" AND component = ?{}", params.len()));
                }
                if let Some(since) = filter.since {
                    params.push(Box::new(since.timestamp_millis()));
                    sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
                }

                params.push(Box::new(limit));
                sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT ?{}", params.len()));

                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut logs = Vec::with_capacity(rows.len());
                for (ts, level, component, message, context_json, correlation_id) in rows {
                    logs.push(OperationalLog {
                        timestamp: DateTime::from_timestamp_millis(ts).ok_or_else(|| {
                            StoreError::InvalidArgument(format!("bad timestamp in row: {ts}"))
                        })?,
                        level: LogLevel::parse(&level),
                        component,
                        message,
                        context: serde_json::from_str(&context_json)?,
                        correlation_id: correlation_id.and_then(|id| Uuid::parse_str(&id).ok()),
                    });
                }
                Ok(logs)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
