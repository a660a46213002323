//! Storage capability
//!
//! The engine talks to persistence only through [`ProgressStore`]: targeted
//! per-level reads, one atomic [`WriteBatch`] commit, and the history log.

use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use summit_model::{
    Action, ActionId, EntityRef, EntityType, Goal, GoalId, ProgressHistoryEntry, SubGoal,
    SubGoalId, Task, TaskId,
};

/// Single write inside a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Overwrite the `progress` field of a goal, subgoal or action
    ///
    /// With `expected_version` set, the write fails with
    /// [`StorageError::Conflict`] unless the stored version still matches.
    /// Every progress write bumps the version.
    Progress {
        /// Target entity
        entity: EntityRef,
        /// New value
        progress: i32,
        /// Version observed by the writer
        expected_version: Option<u64>,
    },

    /// Set or clear the achievement marker (actions) or completion marker (goals)
    Marker {
        /// Target entity
        entity: EntityRef,
        /// `None` clears the marker
        at: Option<DateTime<Utc>>,
    },

    /// Append to the progress history log
    History(ProgressHistoryEntry),
}

/// Ordered set of writes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    /// Create empty batch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unguarded progress write
    pub fn set_progress(&mut self, entity: EntityRef, progress: i32) -> &mut Self {
        self.writes.push(Write::Progress {
            entity,
            progress,
            expected_version: None,
        });
        self
    }

    /// Progress write guarded by the version the caller read
    pub fn set_progress_guarded(
        &mut self,
        entity: EntityRef,
        progress: i32,
        expected_version: u64,
    ) -> &mut Self {
        self.writes.push(Write::Progress {
            entity,
            progress,
            expected_version: Some(expected_version),
        });
        self
    }

    /// Marker write
    pub fn set_marker(&mut self, entity: EntityRef, at: Option<DateTime<Utc>>) -> &mut Self {
        self.writes.push(Write::Marker { entity, at });
        self
    }

    /// History append
    pub fn append_history(&mut self, entry: ProgressHistoryEntry) -> &mut Self {
        self.writes.push(Write::History(entry));
        self
    }

    /// Borrow the writes in order
    #[inline]
    #[must_use]
    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Take the writes in order
    #[inline]
    #[must_use]
    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    /// Number of writes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Check if batch is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of history appends in the batch
    #[must_use]
    pub fn history_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| matches!(w, Write::History(_)))
            .count()
    }
}

/// History range query; both bounds inclusive and optional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Entity ID
    pub entity_id: String,
    /// Entity level
    pub entity_type: EntityType,
    /// Earliest timestamp
    pub start: Option<DateTime<Utc>>,
    /// Latest timestamp
    pub end: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    /// Unbounded query for one entity
    #[inline]
    #[must_use]
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_id: entity.id.clone(),
            entity_type: entity.entity_type,
            start: None,
            end: None,
        }
    }

    /// With lower bound
    #[inline]
    #[must_use]
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// With upper bound
    #[inline]
    #[must_use]
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Check if an entry falls inside the query
    #[must_use]
    pub fn matches(&self, entry: &ProgressHistoryEntry) -> bool {
        entry.entity_type == self.entity_type
            && entry.entity_id == self.entity_id
            && self.start.map_or(true, |s| entry.timestamp >= s)
            && self.end.map_or(true, |e| entry.timestamp <= e)
    }
}

/// Persistence capability required by the engine
///
/// Loads return `Ok(None)` for absent entities; the engine maps that to its
/// own not-found error. Loaded nodes carry their full subtree.
#[async_trait]
pub trait ProgressStore: Send + Sync + Debug {
    /// Load a goal with subgoals, actions and tasks
    async fn load_goal(&self, id: &GoalId) -> Result<Option<Goal>, StorageError>;

    /// Load a subgoal with actions and tasks
    async fn load_sub_goal(&self, id: &SubGoalId) -> Result<Option<SubGoal>, StorageError>;

    /// Load an action with its tasks
    async fn load_action(&self, id: &ActionId) -> Result<Option<Action>, StorageError>;

    /// Load a task
    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError>;

    /// Apply every write in the batch atomically
    ///
    /// # Errors
    /// Any failing write aborts the batch and nothing is persisted.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// History entries matching the query, ascending by timestamp
    async fn history_entries(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ProgressHistoryEntry>, StorageError>;

    /// Delete history entries strictly older than `cutoff`
    ///
    /// # Returns
    /// Number of entries removed
    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}
