//! Recalculation orchestrator
//!
//! [`ProgressEngine`] owns the cache, history store and clock, and drives
//! every read and write of progress values.
//!
//! # Cascade
//!
//! ```text
//! Task ──▶ Action ──▶ SubGoal ──▶ Goal
//!   │        │           │          │
//!   └────────┴── one WriteBatch ────┘──▶ commit ──▶ cache ──▶ maybe_cleanup
//! ```
//!
//! The batch holds version-guarded progress writes for the three levels,
//! history for every changed value, and marker updates. Either all of it is
//! committed or nothing is.

use crate::config::EngineConfig;
use crate::error::ProgressError;
use crate::history::ProgressHistory;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use summit_cache::{CacheStats, ProgressCache};
use summit_model::{
    action_progress, goal_progress, sub_goal_progress, ActionId, Clock, EntityRef, EntityType,
    Goal, GoalId, ProgressHistoryEntry, SubGoalId, SystemClock, TaskId, MAX_PROGRESS,
};
use summit_store::{ProgressStore, WriteBatch};

/// Previous and new progress of one level in a cascade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelChange {
    /// Updated entity
    pub entity: EntityRef,
    /// Stored value before the cascade
    pub previous: i32,
    /// Value written by the cascade
    pub current: u8,
    /// Store version of the row after the write
    pub version: u64,
}

impl LevelChange {
    /// Whether the stored value actually moved
    #[inline]
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != i32::from(self.current)
    }
}

/// Result of [`ProgressEngine::recalculate_from_task`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeOutcome {
    /// Task that triggered the cascade
    pub task_id: TaskId,
    /// Action level
    pub action: LevelChange,
    /// SubGoal level
    pub sub_goal: LevelChange,
    /// Goal level
    pub goal: LevelChange,
}

/// Marker transition for a node reaching or leaving 100
///
/// `None` means leave the marker alone, `Some(value)` means write `value`.
pub(crate) fn marker_update(
    current: Option<DateTime<Utc>>,
    progress: u8,
    now: DateTime<Utc>,
) -> Option<Option<DateTime<Utc>>> {
    match (progress >= MAX_PROGRESS, current.is_some()) {
        (true, false) => Some(Some(now)),
        (false, true) => Some(None),
        _ => None,
    }
}

/// Stage a guarded progress write, plus history when the value changed
pub(crate) fn stage_progress(
    batch: &mut WriteBatch,
    entity: EntityRef,
    stored: i32,
    version: u64,
    value: u8,
    now: DateTime<Utc>,
    reason: &str,
) -> LevelChange {
    batch.set_progress_guarded(entity.clone(), i32::from(value), version);
    let change = LevelChange {
        entity,
        previous: stored,
        current: value,
        version: version + 1,
    };
    if change.changed() {
        batch.append_history(
            ProgressHistoryEntry::new(&change.entity, value, now).with_reason(reason),
        );
    }
    change
}

/// Progress aggregation engine
#[derive(Debug)]
pub struct ProgressEngine {
    pub(crate) store: Arc<dyn ProgressStore>,
    pub(crate) cache: ProgressCache,
    pub(crate) history: ProgressHistory,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl ProgressEngine {
    /// Create engine on the system clock
    ///
    /// # Errors
    /// `ProgressError::Config` if the configuration is invalid
    pub fn new(store: Arc<dyn ProgressStore>, config: EngineConfig) -> Result<Self, ProgressError> {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    /// Create engine with an explicit clock
    ///
    /// # Errors
    /// `ProgressError::Config` if the configuration is invalid
    pub fn with_clock(
        store: Arc<dyn ProgressStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, ProgressError> {
        let cache = ProgressCache::new(config.cache_capacity);
        Self::with_cache(store, clock, cache, config)
    }

    /// Create engine sharing an existing cache
    ///
    /// # Errors
    /// `ProgressError::Config` if the configuration is invalid
    pub fn with_cache(
        store: Arc<dyn ProgressStore>,
        clock: Arc<dyn Clock>,
        cache: ProgressCache,
        config: EngineConfig,
    ) -> Result<Self, ProgressError> {
        config.validate()?;
        let history = ProgressHistory::new(Arc::clone(&store), Arc::clone(&clock), &config);
        Ok(Self {
            store,
            cache,
            history,
            clock,
            config,
        })
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Progress cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &ProgressCache {
        &self.cache
    }

    /// History store
    #[inline]
    #[must_use]
    pub fn history(&self) -> &ProgressHistory {
        &self.history
    }

    /// Underlying storage
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Goal progress, served from the cache when possible
    ///
    /// A miss recomputes the whole subtree and caches the goal and each of
    /// its subgoals, tagged with the versions of the loaded rows so a
    /// cascade committed meanwhile keeps its newer entries.
    ///
    /// # Errors
    /// `NotFound` for an unknown goal, `Storage` on load failure
    pub async fn calculate_goal_progress(&self, goal_id: &GoalId) -> Result<u8, ProgressError> {
        let key = EntityRef::goal(goal_id);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit.progress);
        }

        let goal = self.require_goal(goal_id).await?;
        let now = self.clock.now();
        for sub in &goal.sub_goals {
            self.cache
                .put(sub.entity_ref(), sub_goal_progress(sub), sub.version, now)
                .await;
        }
        let progress = goal_progress(&goal);
        self.cache.put(key, progress, goal.version, now).await;

        tracing::debug!(goal_id = %goal_id, progress, "computed goal progress");
        Ok(progress)
    }

    /// SubGoal progress, served from the cache when possible
    ///
    /// # Errors
    /// `NotFound` for an unknown subgoal, `Storage` on load failure
    pub async fn calculate_sub_goal_progress(
        &self,
        sub_goal_id: &SubGoalId,
    ) -> Result<u8, ProgressError> {
        let key = EntityRef::sub_goal(sub_goal_id);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit.progress);
        }

        let sub = self
            .store
            .load_sub_goal(sub_goal_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::SubGoal, sub_goal_id))?;
        let progress = sub_goal_progress(&sub);
        self.cache
            .put(key, progress, sub.version, self.clock.now())
            .await;
        Ok(progress)
    }

    /// Action progress, served from the cache when possible
    ///
    /// # Errors
    /// `NotFound` for an unknown action, `Storage` on load failure
    pub async fn calculate_action_progress(
        &self,
        action_id: &ActionId,
    ) -> Result<u8, ProgressError> {
        let key = EntityRef::action(action_id);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit.progress);
        }

        let action = self
            .store
            .load_action(action_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::Action, action_id))?;
        let progress = action_progress(&action);
        self.cache
            .put(key, progress, action.version, self.clock.now())
            .await;
        Ok(progress)
    }

    /// Propagate a task status change up to its goal
    ///
    /// Resolves every level before writing anything, then commits the
    /// Action, SubGoal and Goal values with their history and markers as one
    /// batch.
    ///
    /// # Errors
    /// - `NotFound` naming the first level that does not resolve
    /// - `Storage` if the commit fails; a `Conflict` means another cascade
    ///   on the same goal won and the call may be retried
    pub async fn recalculate_from_task(
        &self,
        task_id: &TaskId,
    ) -> Result<CascadeOutcome, ProgressError> {
        let task = self
            .store
            .load_task(task_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::Task, task_id))?;
        let action_ref = self
            .store
            .load_action(&task.action_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::Action, &task.action_id))?;
        let sub_ref = self
            .store
            .load_sub_goal(&action_ref.sub_goal_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::SubGoal, &action_ref.sub_goal_id))?;
        let goal = self.require_goal(&sub_ref.goal_id).await?;

        // Work from one snapshot of the goal tree so siblings and versions agree.
        let sub = goal
            .find_sub_goal(&sub_ref.id)
            .ok_or_else(|| ProgressError::not_found(EntityType::SubGoal, &sub_ref.id))?;
        let action = sub
            .find_action(&action_ref.id)
            .ok_or_else(|| ProgressError::not_found(EntityType::Action, &action_ref.id))?;

        let action_value = action_progress(action);
        let sub_value = sub_goal_progress(sub);
        let goal_value = goal_progress(&goal);

        let now = self.clock.now();
        let reason = format!("task {} {}", task.id, task.status);
        let mut batch = WriteBatch::new();

        let action_change = stage_progress(
            &mut batch,
            action.entity_ref(),
            action.progress,
            action.version,
            action_value,
            now,
            &reason,
        );
        if let Some(at) = marker_update(action.achieved_at, action_value, now) {
            batch.set_marker(action.entity_ref(), at);
        }
        let sub_change = stage_progress(
            &mut batch,
            sub.entity_ref(),
            sub.progress,
            sub.version,
            sub_value,
            now,
            &reason,
        );
        let goal_change = stage_progress(
            &mut batch,
            goal.entity_ref(),
            goal.progress,
            goal.version,
            goal_value,
            now,
            &reason,
        );
        if let Some(at) = marker_update(goal.completed_at, goal_value, now) {
            batch.set_marker(goal.entity_ref(), at);
        }

        let history_written = batch.history_count();
        if let Err(err) = self.store.commit(batch).await {
            tracing::warn!(task_id = %task_id, goal_id = %goal.id, error = %err, "cascade aborted");
            return Err(err.into());
        }

        // Another cascade may have committed after us and cached already.
        for change in [&action_change, &sub_change, &goal_change] {
            self.cache
                .put(change.entity.clone(), change.current, change.version, now)
                .await;
        }

        tracing::info!(
            task_id = %task_id,
            goal_id = %goal.id,
            action = action_value,
            sub_goal = sub_value,
            goal = goal_value,
            history_written,
            "cascade committed"
        );

        self.history.maybe_cleanup().await;

        Ok(CascadeOutcome {
            task_id: task.id,
            action: action_change,
            sub_goal: sub_change,
            goal: goal_change,
        })
    }

    /// Cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Drop every cache entry and reset the counters
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub(crate) async fn require_goal(&self, goal_id: &GoalId) -> Result<Goal, ProgressError> {
        self.store
            .load_goal(goal_id)
            .await?
            .ok_or_else(|| ProgressError::not_found(EntityType::Goal, goal_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn marker_set_and_cleared_at_the_boundary() {
        let now = Utc::now();
        assert_eq!(marker_update(None, 100, now), Some(Some(now)));
        assert_eq!(marker_update(None, 99, now), None);
        let earlier = now - Duration::days(1);
        assert_eq!(marker_update(Some(earlier), 100, now), None);
        assert_eq!(marker_update(Some(earlier), 99, now), Some(None));
    }

    #[test]
    fn staging_skips_history_for_unchanged_values() {
        let entity = EntityRef::new(EntityType::Goal, "g");
        let mut batch = WriteBatch::new();

        let same = stage_progress(&mut batch, entity.clone(), 40, 3, 40, Utc::now(), "r");
        assert!(!same.changed());
        assert_eq!(same.version, 4);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.history_count(), 0);

        let moved = stage_progress(&mut batch, entity, 999, 4, 50, Utc::now(), "r");
        assert!(moved.changed());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.history_count(), 1);
    }
}
