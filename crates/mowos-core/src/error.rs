//! Error types for the mowos-core crate.
//!
//! Every public coordinator API returns [`CoreError`]. Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use thiserror::Error;

/// Alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified error type for the data-core coordinator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration value failed validation. Fatal at initialize().
    #[error("invalid configuration: {0}")]
    Config(String),

    /// One stage of the staged startup failed; names the stage so the
    /// process owner knows exactly what did not come up.
    #[error("initialization failed at stage `{stage}`: {source}")]
    InitStage {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A reading or config entry was rejected before any write happened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The durable store rejected an operation the caller depends on.
    #[error("store error: {0}")]
    Store(#[from] mowos_store::StoreError),

    /// The state machine reported a failure.
    #[error("state error: {0}")]
    State(#[from] mowos_state::StateError),

    /// The analytics layer reported a failure.
    #[error("analytics error: {0}")]
    Analytics(#[from] mowos_analytics::AnalyticsError),
}

impl From<mowos_types::TypeError> for CoreError {
    fn from(err: mowos_types::TypeError) -> Self {
        Self::Validation(err.to_string())
    }
}
