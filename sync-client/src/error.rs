//! Client errors.

use chat_sync_core::{PolicyViolation, TransitionError};
use chat_sync_store::StorageError;

use crate::gateway::TransportError;

/// Errors surfaced by the sync coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A recall or edit request violated the local policy.
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// An illegal delivery status transition was attempted.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// The referenced message does not exist locally.
    #[error("message not found: {0}")]
    NotFound(String),
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, SyncError>;
