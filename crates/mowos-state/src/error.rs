//! Error types for the mowos-state crate.

use thiserror::Error;

/// Alias for `Result<T, StateError>`.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the state machine.
#[derive(Debug, Error)]
pub enum StateError {
    /// No checkpoint with the given name is live in the cache.
    #[error("checkpoint not found: {name}")]
    CheckpointNotFound { name: String },

    /// The durable store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] mowos_store::StoreError),
}
