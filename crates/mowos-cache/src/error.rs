//! Error types for the mowos-cache crate.
//!
//! Most cache operations deliberately do **not** return these errors —
//! the public service degrades to miss/false and counts the failure. The
//! typed error exists for construction-time problems and for internal
//! plumbing that the service converts at its boundary.

use thiserror::Error;

/// Alias for `Result<T, CacheError>`.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur inside the cache tier.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Value could not be serialized for storage.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A cache configuration value was invalid.
    #[error("invalid cache config: {0}")]
    InvalidConfig(String),
}
