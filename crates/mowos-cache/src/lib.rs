//! # mowos-cache
//!
//! Ephemeral cache tier for the MowOS data core.
//!
//! Provides a TTL'd key-value accelerator with category-scoped defaults,
//! prefix queries, bounded append-only streams, and pub/sub topics. The
//! key-value tier sits behind the [`CacheBackend`] trait with two
//! implementations selected at construction:
//!
//! - [`MokaBackend`] — lock-free concurrent cache (`moka`) with real
//!   per-entry TTL eviction. The default.
//! - [`MemoryBackend`] — plain guarded map with lazy expiry. Used when the
//!   accelerator tier is disabled; contract-identical, so callers never
//!   special-case availability.
//!
//! The cache is a best-effort accelerator: internal failures degrade to a
//! miss (or `false`) and bump an error counter instead of propagating. The
//! durable store remains ground truth.

pub mod backend;
pub mod error;
pub mod service;

pub use backend::{CacheBackend, MemoryBackend, MokaBackend};
pub use error::{CacheError, CacheResult};
pub use service::{CacheCategory, CacheConfig, CacheStats, CacheStatsSnapshot, SensorCache};
