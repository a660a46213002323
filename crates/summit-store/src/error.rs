//! Storage error types

use summit_model::EntityRef;

/// Failure reported by a [`ProgressStore`](crate::ProgressStore)
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// A guarded write found a different version than the one it read
    #[error("write conflict on {entity}: expected version {expected}")]
    Conflict {
        /// Entity whose version moved
        entity: EntityRef,
        /// Version the writer read
        expected: u64,
    },

    /// Write target does not exist
    #[error("write target not found: {entity}")]
    MissingEntity {
        /// Missing entity
        entity: EntityRef,
    },

    /// Write that the store cannot express (e.g. progress on a task)
    #[error("invalid write: {0}")]
    InvalidWrite(String),

    /// Underlying I/O or database failure
    #[error("storage backend error: {message}")]
    Backend {
        /// Backend message
        message: String,
        /// Whether the backend reported a transient condition
        retryable: bool,
    },

    /// Persisted row cannot be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Failure injected by a test store
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StorageError {
    /// Create non-retryable backend error
    #[inline]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Check if the caller may retry the whole operation
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Backend { retryable: true, .. }
        )
    }
}
