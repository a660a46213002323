//! Testing utilities for the Summit workspace
//!
//! Shared fixtures for building goal trees and a harness wiring an engine to
//! an in-memory store and a manual clock.

#![allow(missing_docs)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use summit_engine::{CascadeOutcome, EngineConfig, ProgressEngine, ProgressError};
use summit_model::{
    Action, ActionKind, Goal, SubGoal, SubGoalId, Task, TaskId, TaskStatus,
};
use summit_store::MemoryStore;

/// Layout of one action: `(kind, completed, total)`
pub type ActionSpec = (ActionKind, usize, usize);

/// Deterministic starting instant for clocks in tests
pub fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Action with `completed` of `total` tasks done; the rest not started
pub fn build_action(sub_goal_id: SubGoalId, (kind, completed, total): ActionSpec) -> Action {
    let mut action = Action::new(sub_goal_id, kind);
    for i in 0..total {
        let status = if i < completed {
            TaskStatus::Completed
        } else {
            TaskStatus::NotStarted
        };
        action.tasks.push(Task::new(action.id.clone(), status));
    }
    action
}

/// Goal with one subgoal per outer slice and one action per spec
pub fn build_goal(layout: &[&[ActionSpec]]) -> Goal {
    let mut goal = Goal::new();
    for actions in layout {
        let mut sub = SubGoal::new(goal.id.clone());
        for spec in *actions {
            sub.actions.push(build_action(sub.id.clone(), *spec));
        }
        goal.sub_goals.push(sub);
    }
    goal
}

/// First task of an action that is not yet completed
pub fn open_task(goal: &Goal, sub_index: usize, action_index: usize) -> Option<TaskId> {
    goal.sub_goals
        .get(sub_index)?
        .actions
        .get(action_index)?
        .tasks
        .iter()
        .find(|t| !t.status.is_complete())
        .map(|t| t.id.clone())
}

/// Engine over a seeded [`MemoryStore`] with a [`ManualClock`](summit_model::ManualClock)
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<summit_model::ManualClock>,
    pub engine: ProgressEngine,
    pub goal: Goal,
}

impl TestHarness {
    /// Harness with default configuration
    pub fn new(goal: Goal) -> Self {
        Self::with_config(goal, EngineConfig::default())
    }

    /// Harness with explicit configuration
    pub fn with_config(goal: Goal, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_goal(&goal);
        let clock = Arc::new(summit_model::ManualClock::new(fixed_start()));
        let engine = ProgressEngine::with_clock(store.clone(), clock.clone(), config)
            .unwrap_or_else(|e| panic!("invalid test config: {e}"));
        Self {
            store,
            clock,
            engine,
            goal,
        }
    }

    /// Mark a task completed and cascade
    pub async fn complete(&self, task_id: &TaskId) -> Result<CascadeOutcome, ProgressError> {
        self.set_status(task_id, TaskStatus::Completed).await
    }

    /// Change a task status and cascade
    pub async fn set_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<CascadeOutcome, ProgressError> {
        self.store.set_task_status(task_id, status)?;
        self.engine.recalculate_from_task(task_id).await
    }
}
