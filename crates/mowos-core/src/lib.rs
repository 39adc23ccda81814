//! # mowos-core
//!
//! The coordinator of the MowOS data core — the single entry point the
//! transport and control layers talk to.
//!
//! - **[`coordinator`]** — staged initialization, fan-out writes
//!   (durable store gates success, cache/analytics are best-effort),
//!   cache-first reads, health scoring, export, ordered shutdown.
//! - **[`events`]** — typed event stream over `tokio::sync::broadcast`
//!   plus named handlers with failure isolation.
//! - **[`config`]** — validating builder for the whole core.
//! - **[`error`]** — unified [`CoreError`] via `thiserror`.
//!
//! ## Quick start
//!
//! ```ignore
//! use mowos_core::{CoreConfig, Coordinator};
//!
//! let config = CoreConfig::builder("data/mowos.db")
//!     .backup_dir("data/backups")
//!     .build()?;
//! let core = Coordinator::initialize(config).await?;
//!
//! core.store_sensor_reading(reading).await?;
//! let state = core.current_state().await;
//!
//! core.shutdown().await;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;

// Re-export the most commonly used types at the crate root.
pub use config::{CoreConfig, CoreConfigBuilder};
pub use coordinator::{Coordinator, HealthStatus, SystemHealth};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus, EventHandler, EventKind};

// The rest of the workspace, re-exported for embedders that only want to
// depend on mowos-core.
pub use mowos_analytics as analytics;
pub use mowos_cache as cache;
pub use mowos_state as state;
pub use mowos_store as store;
pub use mowos_types as types;
