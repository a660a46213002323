//! Error types for the progress engine
//!
//! - Missing entities anywhere in the hierarchy
//! - Integrity violations found by the validator
//! - Storage failures, propagated verbatim
//! - Invalid configuration

use crate::integrity::Discrepancy;
use summit_model::{EntityType, GoalId};
use summit_store::StorageError;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// Referenced goal, subgoal, action or task does not exist
    #[error("{entity_type} not found: {id}")]
    NotFound {
        /// Level of the missing entity
        entity_type: EntityType,
        /// ID that failed to resolve
        id: String,
    },

    /// Persisted progress disagrees with recomputed truth
    #[error("integrity violation on goal {goal_id}: {count} discrepancies", count = .discrepancies.len())]
    IntegrityViolation {
        /// Audited goal
        goal_id: GoalId,
        /// Every mismatching level
        discrepancies: Vec<Discrepancy>,
    },

    /// Storage collaborator failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProgressError {
    /// Create not-found error
    #[inline]
    pub fn not_found(entity_type: EntityType, id: impl AsRef<str>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.as_ref().to_string(),
        }
    }

    /// Check if error is a missing entity
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the caller may retry
    ///
    /// Only transient storage failures (including write conflicts between
    /// concurrent cascades) are retryable.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_retryable())
    }
}
