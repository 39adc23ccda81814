//! Versioned configuration persistence.
//!
//! Entries are unique per `(section, key)`. Every write to an existing
//! entry bumps its version, so consumers can detect configuration drift
//! without diffing values.

use chrono::{DateTime, Utc};
use mowos_types::{ConfigDataType, ConfigurationEntry};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// CRUD operations on the `configurations` table.
#[derive(Clone)]
pub struct ConfigStore {
    db: Database,
}

type ConfigRow = (String, String, String, String, i64, i64, String);

fn row_to_entry(row: ConfigRow) -> StoreResult<ConfigurationEntry> {
    let (section, key, value_json, data_type, last_modified, version, metadata_json) = row;
    Ok(ConfigurationEntry {
        section,
        key,
        value: serde_json::from_str(&value_json)?,
        data_type: ConfigDataType::parse(&data_type),
        last_modified: DateTime::from_timestamp_millis(last_modified).ok_or_else(|| {
            StoreError::InvalidArgument(format!("bad last_modified in row: {last_modified}"))
        })?,
        version,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}

const SELECT_COLUMNS: &str =
    "section, key, value_json, data_type, last_modified, version, metadata_json";

impl ConfigStore {
    /// Create a config store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update an entry, returning the stored record.
    ///
    /// On conflict the version increments and `last_modified` is restamped;
    /// the caller's `version` field is ignored on update.
    #[instrument(skip(self, entry), fields(section = %entry.section, key = %entry.key))]
    pub async fn upsert(&self, entry: &ConfigurationEntry) -> StoreResult<ConfigurationEntry> {
        let section = entry.section.clone();
        let key = entry.key.clone();
        let value_json = serde_json::to_string(&entry.value)?;
        let data_type = entry.data_type.as_str().to_string();
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        let now = Utc::now().timestamp_millis();

        let stored = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO configurations (section, key, value_json, data_type, last_modified, version, metadata_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6) \
                     ON CONFLICT(section, key) DO UPDATE SET \
                         value_json = excluded.value_json, \
                         data_type = excluded.data_type, \
                         last_modified = excluded.last_modified, \
                         version = configurations.version + 1, \
                         metadata_json = excluded.metadata_json",
                    rusqlite::params![section, key, value_json, data_type, now, metadata_json],
                )?;

                let row = conn.query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM configurations WHERE section = ?1 AND key = ?2"
                    ),
                    rusqlite::params![section, key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )?;
                row_to_entry(row)
            })
            .await?;

        debug!(
            section = %stored.section,
            key = %stored.key,
            version = stored.version,
            "configuration stored"
        );
        Ok(stored)
    }

    /// Fetch one entry, returning `None` if absent.
    #[instrument(skip(self))]
    pub async fn get(&self, section: &str, key: &str) -> StoreResult<Option<ConfigurationEntry>> {
        let section = section.to_string();
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM configurations WHERE section = ?1 AND key = ?2"
                    ),
                    rusqlite::params![section, key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                );
                match result {
                    Ok(row) => Ok(Some(row_to_entry(row)?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// List entries, optionally restricted to one section.
    #[instrument(skip(self))]
    pub async fn list(&self, section: Option<&str>) -> StoreResult<Vec<ConfigurationEntry>> {
        let section = section.map(|s| s.to_string());
        self.db
            .execute(move |conn| {
                let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match section {
                    Some(section) => (
                        format!(
                            "SELECT {SELECT_COLUMNS} FROM configurations WHERE section = ?1 ORDER BY section, key"
                        ),
                        vec![Box::new(section)],
                    ),
                    None => (
                        format!("SELECT {SELECT_COLUMNS} FROM configurations ORDER BY section, key"),
                        Vec::new(),
                    ),
                };

                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter().map(row_to_entry).collect()
            })
            .await
    }

    /// Delete an entry, returning `true` if it existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, section: &str, key: &str) -> StoreResult<bool> {
        let section = section.to_string();
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM configurations WHERE section = ?1 AND key = ?2",
                    rusqlite::params![section, key],
                )?;
                Ok(deleted > 0)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> ConfigStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        ConfigStore::new(db)
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = setup().await;
        assert!(store.get("mowing", "absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let store = setup().await;
        let entry =
            ConfigurationEntry::new("mowing", "blade_height_mm", serde_json::json!(35)).unwrap();
        let stored = store.upsert(&entry).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.data_type, ConfigDataType::Integer);

        let got = store.get("mowing", "blade_height_mm").await.unwrap().unwrap();
        assert_eq!(got.value, serde_json::json!(35));
    }

    #[tokio::test]
    async fn rewrite_bumps_version() {
        let store = setup().await;
        let entry =
            ConfigurationEntry::new("mowing", "blade_height_mm", serde_json::json!(35)).unwrap();
        store.upsert(&entry).await.unwrap();

        let updated =
            ConfigurationEntry::new("mowing", "blade_height_mm", serde_json::json!(40)).unwrap();
        let stored = store.upsert(&updated).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value, serde_json::json!(40));

        let third =
            ConfigurationEntry::new("mowing", "blade_height_mm", serde_json::json!(45)).unwrap();
        assert_eq!(store.upsert(&third).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn list_by_section() {
        let store = setup().await;
        for (section, key, value) in [
            ("mowing", "blade_height_mm", serde_json::json!(35)),
            ("mowing", "speed", serde_json::json!(0.8)),
            ("navigation", "gps_rate_hz", serde_json::json!(5)),
        ] {
            store
                .upsert(&ConfigurationEntry::new(section, key, value).unwrap())
                .await
                .unwrap();
        }

        let mowing = store.list(Some("mowing")).await.unwrap();
        assert_eq!(mowing.len(), 2);

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = setup().await;
        store
            .upsert(&ConfigurationEntry::new("a", "b", serde_json::json!(1)).unwrap())
            .await
            .unwrap();
        assert!(store.delete("a", "b").await.unwrap());
        assert!(!store.delete("a", "b").await.unwrap());
    }
}
