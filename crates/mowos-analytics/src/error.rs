//! Error types for the mowos-analytics crate.

use thiserror::Error;

/// Alias for `Result<T, AnalyticsError>`.
pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

/// Errors that can occur in the analytics layer.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// A durable-store query failed.
    #[error("store error: {0}")]
    Store(#[from] mowos_store::StoreError),
}
