//! SQLite database setup with WAL mode and performance pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` so store I/O never stalls the runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use rusqlite::backup::Backup;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Thread-safe handle to the controller's SQLite database.
///
/// All read/write operations go through [`Database::execute`], which
/// dispatches onto the blocking thread pool. Each write is a self-contained
/// transaction at the SQLite level; there is no cross-call transaction
/// state to leak.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// Blocks briefly on file I/O — call during startup or wrap in
    /// `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database — useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    ///
    /// This is `initialize()` for the durable tier: migration failure here
    /// is a configuration error and must abort startup.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    ///
    /// Safe to call from several tasks at once: migrations serialize on the
    /// connection lock and each version applies exactly once.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            migration::run_all(&conn)
        })
        .await?
    }

    /// The latest applied migration version (0 on a virgin database).
    pub async fn schema_version(&self) -> StoreResult<u32> {
        self.execute(migration::current_version).await
    }

    /// Execute an arbitrary closure against the connection on the blocking
    /// pool. This is the primary way to interact with the database.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure (for multi-statement transactions) on the
    /// blocking pool.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    // ── backup ───────────────────────────────────────────────────────

    /// Produce a consistent, timestamped copy of the database under `dir`
    /// while writers remain active, using SQLite's online backup API.
    ///
    /// Returns the path of the written file.
    pub async fn backup_to(&self, dir: impl AsRef<Path> + Send + 'static) -> StoreResult<PathBuf> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Backup(format!("create {}: {e}", dir.display())))?;

            let stamp = Utc::now().format("%Y%m%dT%H%M%S");
            let dest_path = dir.join(format!("mowos-{stamp}.db"));

            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            let mut dest = Connection::open(&dest_path)?;
            {
                let backup = Backup::new(&conn, &mut dest)?;
                // 256 pages per step, brief pauses so the busy handler can
                // let concurrent writers through.
                backup
                    .run_to_completion(256, Duration::from_millis(10), None)
                    .map_err(|e| StoreError::Backup(e.to_string()))?;
            }

            info!(path = %dest_path.display(), "database backup written");
            Ok(dest_path)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply performance pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite performance pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL — a power failure can lose the last
        // transaction but never corrupts the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 64 MiB memory-mapped I/O — controller-class hardware, keep it modest.
        conn.pragma_update(None, "mmap_size", 67_108_864_i64)?;

        // Negative value means KiB: ~16 MiB page cache.
        conn.pragma_update(None, "cache_size", -16_000_i32)?;

        // Temp tables and indices in memory, not on flash.
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, mmap 64MiB, cache 16MiB)");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
