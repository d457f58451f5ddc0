//! Error types for sync-store.

use std::path::PathBuf;

/// Storage layer errors.
///
/// Every storage failure is surfaced to the caller, never silently dropped.
/// [`StorageError::Corrupt`] is the only class treated as fatal to the store;
/// everything else is locally recoverable.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row failed to decode - unrecoverable corruption.
    #[error("corrupt row: {context}")]
    Corrupt {
        /// What failed to decode.
        context: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

impl StorageError {
    pub(crate) fn corrupt(context: impl Into<String>) -> Self {
        Self::Corrupt {
            context: context.into(),
        }
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
