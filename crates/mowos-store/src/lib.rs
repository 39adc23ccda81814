//! # mowos-store
//!
//! Durable storage engine for the MowOS data core.
//!
//! SQLite-backed persistence (WAL mode, mmap) for sensor readings, state
//! snapshots, configuration, performance metrics, and operational logs,
//! with versioned transactional migrations, retention-driven cleanup, and
//! online backup while writers stay active.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  ReadingStore   (sensor_readings)             │
//! │  StateStore     (operational_states)          │
//! │  ConfigStore    (configurations, versioned)   │
//! │  TelemetryStore (metrics + logs)              │
//! ├───────────────────────────────────────────────┤
//! │  RetentionManager (per-table horizons, vacuum)│
//! ├───────────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap + backup)      │
//! │  Migrations (versioned, transactional)        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Every store write returns a `StoreResult` — durable writes are never
//! silently dropped; the caller decides whether to retry.

pub mod config_store;
pub mod db;
pub mod error;
pub mod migration;
pub mod readings;
pub mod retention;
pub mod states;
pub mod telemetry;

// ── re-exports ───────────────────────────────────────────────────────

pub use config_store::ConfigStore;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use readings::{ReadingFilter, ReadingStore};
pub use retention::{CleanupReport, RetentionManager, RetentionPolicy};
pub use states::StateStore;
pub use telemetry::{LogFilter, MetricFilter, TelemetryStore};
