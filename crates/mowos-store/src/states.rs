//! Operational state snapshot persistence.
//!
//! Each row is a full snapshot of the live [`OperationalState`] at flush
//! time. The newest row is the durable ground truth used by recovery when
//! the cache has nothing fresher.

use chrono::DateTime;
use mowos_types::{MowerState, OpMode, OperationalState};
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// CRUD operations on the `operational_states` table.
#[derive(Clone)]
pub struct StateStore {
    db: Database,
}

type StateRow = (
    String,
    String,
    f64,
    Option<String>,
    f64,
    Option<i64>,
    i64,
    String,
);

fn row_to_state(row: StateRow) -> StoreResult<OperationalState> {
    let (state, mode, battery_level, current_task, progress, estimated, last_update, metadata) =
        row;
    Ok(OperationalState {
        state: MowerState::parse(&state),
        mode: OpMode::parse(&mode),
        battery_level,
        current_task,
        progress,
        estimated_completion: estimated.and_then(DateTime::from_timestamp_millis),
        last_update: DateTime::from_timestamp_millis(last_update).ok_or_else(|| {
            StoreError::InvalidArgument(format!("bad last_update in row: {last_update}"))
        })?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

impl StateStore {
    /// Create a state store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a state snapshot, returning its row id.
    #[instrument(skip(self, state), fields(state = %state.state))]
    pub async fn insert(&self, state: &OperationalState) -> StoreResult<i64> {
        let state_str = state.state.as_str().to_string();
        let mode = state.mode.as_str().to_string();
        let battery_level = state.battery_level;
        let current_task = state.current_task.clone();
        let progress = state.progress;
        let estimated = state.estimated_completion.map(|t| t.timestamp_millis());
        let last_update = state.last_update.timestamp_millis();
        let metadata_json = serde_json::to_string(&state.metadata)?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO operational_states (state, mode, battery_level, current_task, progress, estimated_completion, last_update, metadata_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        state_str,
                        mode,
                        battery_level,
                        current_task,
                        progress,
                        estimated,
                        last_update,
                        metadata_json
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// The most recently persisted snapshot, if any.
    #[instrument(skip(self))]
    pub async fn latest(&self) -> StoreResult<Option<OperationalState>> {
        self.db
            .execute(|conn| {
                let result = conn.query_row(
                    "SELECT state, mode, battery_level, current_task, progress, estimated_completion, last_update, metadata_json \
                     FROM operational_states ORDER BY last_update DESC, id DESC LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                );
                match result {
                    Ok(row) => Ok(Some(row_to_state(row)?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// The `limit` most recent snapshots, newest first.
    #[instrument(skip(self))]
    pub async fn history(&self, limit: u32) -> StoreResult<Vec<OperationalState>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT state, mode, battery_level, current_task, progress, estimated_completion, last_update, metadata_json \
                     FROM operational_states ORDER BY last_update DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter().map(row_to_state).collect()
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mowos_types::Metadata;

    async fn setup() -> StateStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        StateStore::new(db)
    }

    #[tokio::test]
    async fn latest_on_empty_store_is_none() {
        let store = setup().await;
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_and_fetch_latest() {
        let store = setup().await;

        let mut state = OperationalState::default();
        state.state = MowerState::Active;
        state.mode = OpMode::Automatic;
        state.battery_level = 0.82;
        state.current_task = Some("zone_a".to_string());
        state
            .metadata
            .insert("blade_rpm".to_string(), serde_json::json!(2800));
        store.insert(&state).await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.state, MowerState::Active);
        assert!((latest.battery_level - 0.82).abs() < f64::EPSILON);
        assert_eq!(latest.current_task.as_deref(), Some("zone_a"));
        assert_eq!(latest.metadata["blade_rpm"], serde_json::json!(2800));
    }

    #[tokio::test]
    async fn latest_prefers_most_recent_timestamp() {
        let store = setup().await;

        let mut older = OperationalState::default();
        older.state = MowerState::Idle;
        older.last_update = Utc::now() - chrono::Duration::minutes(10);

        let mut newer = OperationalState::default();
        newer.state = MowerState::Charging;

        // Insert newest first so rowid order alone would give the wrong answer.
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.state, MowerState::Charging);
    }

    #[tokio::test]
    async fn unknown_state_string_survives_persistence() {
        let store = setup().await;

        let mut state = OperationalState::default();
        state.state = MowerState::Unknown("legacy_docking".to_string());
        state.metadata = Metadata::new();
        store.insert(&state).await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(
            latest.state,
            MowerState::Unknown("legacy_docking".to_string())
        );
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = setup().await;
        for (i, s) in [MowerState::Starting, MowerState::Idle, MowerState::Active]
            .into_iter()
            .enumerate()
        {
            let mut state = OperationalState::default();
            state.state = s;
            state.last_update = Utc::now() - chrono::Duration::minutes(10 - i as i64);
            store.insert(&state).await.unwrap();
        }

        let history = store.history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, MowerState::Active);
        assert_eq!(history[1].state, MowerState::Idle);
    }
}
