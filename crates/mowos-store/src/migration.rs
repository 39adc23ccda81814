//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once — including when several tasks race
//! to initialize at startup, since each migration applies inside a
//! `BEGIN IMMEDIATE` transaction.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema — readings, states, configurations, metrics, logs",
        sql: r#"
            CREATE TABLE sensor_readings (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id     TEXT NOT NULL,
                sensor_type   TEXT NOT NULL,
                timestamp     INTEGER NOT NULL,
                value_json    TEXT NOT NULL,
                unit          TEXT NOT NULL DEFAULT '',
                quality       REAL NOT NULL CHECK(quality >= 0.0 AND quality <= 1.0),
                metadata_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX idx_readings_sensor_ts ON sensor_readings(sensor_id, timestamp DESC);
            CREATE INDEX idx_readings_type_ts ON sensor_readings(sensor_type, timestamp DESC);
            CREATE INDEX idx_readings_ts ON sensor_readings(timestamp);

            CREATE TABLE operational_states (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                state                TEXT NOT NULL,
                mode                 TEXT NOT NULL,
                battery_level        REAL NOT NULL DEFAULT 0.0,
                current_task         TEXT,
                progress             REAL NOT NULL DEFAULT 0.0,
                estimated_completion INTEGER,
                last_update          INTEGER NOT NULL,
                metadata_json        TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX idx_states_last_update ON operational_states(last_update DESC);

            CREATE TABLE configurations (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                section       TEXT NOT NULL,
                key           TEXT NOT NULL,
                value_json    TEXT NOT NULL,
                data_type     TEXT NOT NULL CHECK(data_type IN ('string','integer','float','boolean','json')),
                last_modified INTEGER NOT NULL,
                version       INTEGER NOT NULL DEFAULT 1,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                UNIQUE(section, key)
            );

            CREATE TABLE performance_metrics (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_name TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                value       REAL NOT NULL,
                category    TEXT NOT NULL DEFAULT 'general',
                tags_json   TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX idx_metrics_name_ts ON performance_metrics(metric_name, timestamp DESC);
            CREATE INDEX idx_metrics_ts ON performance_metrics(timestamp);

            CREATE TABLE operational_logs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp      INTEGER NOT NULL,
                level          TEXT NOT NULL CHECK(level IN ('debug','info','warn','error')),
                component      TEXT NOT NULL,
                message        TEXT NOT NULL,
                context_json   TEXT NOT NULL DEFAULT '{}',
                correlation_id TEXT
            );
            CREATE INDEX idx_logs_ts ON operational_logs(timestamp);
            CREATE INDEX idx_logs_component ON operational_logs(component, timestamp DESC);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        new_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "all migrations applied"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let exists: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = '_migrations'",
            [],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;
    if exists == 0 {
        return Ok(0);
    }

    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // BEGIN IMMEDIATE takes the write lock up front, so two processes
    // racing through initialize() serialize here and the loser sees the
    // version row the winner inserted.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        let already: i64 = conn
            .query_row(
                "SELECT count(*) FROM _migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        if already > 0 {
            debug!(version = migration.version, "migration already applied, skipping");
            return Ok(());
        }

        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(version = migration.version, "migration applied successfully");
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    /// The expected latest migration version (update when adding migrations).
    const LATEST_VERSION: u32 = 1;

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn current_version_on_virgin_db_is_zero() {
        let conn = setup_conn();
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        assert!(tables.contains(&"sensor_readings".to_string()));
        assert!(tables.contains(&"operational_states".to_string()));
        assert!(tables.contains(&"configurations".to_string()));
        assert!(tables.contains(&"performance_metrics".to_string()));
        assert!(tables.contains(&"operational_logs".to_string()));
    }

    #[test]
    fn quality_check_constraint_is_enforced() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO sensor_readings (sensor_id, sensor_type, timestamp, value_json, unit, quality, metadata_json) \
             VALUES ('s1', 'battery', 0, '1.0', 'V', 1.5, '{}')",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn configurations_unique_per_section_key() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO configurations (section, key, value_json, data_type, last_modified) \
             VALUES ('mowing', 'height', '35', 'integer', 0)",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO configurations (section, key, value_json, data_type, last_modified) \
             VALUES ('mowing', 'height', '40', 'integer', 0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn log_level_check_constraint_is_enforced() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO operational_logs (timestamp, level, component, message) \
             VALUES (0, 'loud', 'core', 'hello')",
            [],
        );
        assert!(bad.is_err());
    }
}
