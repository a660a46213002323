//! In-memory store
//!
//! Pure in-process implementation of [`ProgressStore`] used by tests and
//! simulations. A commit checks every write of its batch under the write
//! lock before applying any of them in place, so readers never observe a
//! partial batch and a commit costs only the rows it touches.
//!
//! Failure injection ([`FailPoint`]) lets tests break a specific write inside
//! an otherwise valid batch.

use crate::error::StorageError;
use crate::store::{HistoryQuery, ProgressStore, Write, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use summit_model::{
    Action, ActionId, ActionKind, EntityRef, EntityType, Goal, GoalId, ProgressHistoryEntry,
    SubGoal, SubGoalId, Task, TaskId, TaskStatus,
};

/// Point at which the store should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Progress writes to entities of this level
    ProgressWrite(EntityType),
    /// Any marker write
    MarkerWrite,
    /// Any history append
    HistoryAppend,
    /// History purges
    Purge,
    /// Every load
    Read,
}

#[derive(Debug, Clone)]
struct GoalRow {
    progress: i32,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    sub_goals: Vec<SubGoalId>,
}

#[derive(Debug, Clone)]
struct SubGoalRow {
    goal_id: GoalId,
    progress: i32,
    version: u64,
    actions: Vec<ActionId>,
}

#[derive(Debug, Clone)]
struct ActionRow {
    sub_goal_id: SubGoalId,
    kind: ActionKind,
    progress: i32,
    achieved_at: Option<DateTime<Utc>>,
    version: u64,
    tasks: Vec<TaskId>,
}

#[derive(Debug, Clone)]
struct TaskRow {
    action_id: ActionId,
    status: TaskStatus,
}

#[derive(Debug, Clone, Default)]
struct State {
    goals: HashMap<GoalId, GoalRow>,
    sub_goals: HashMap<SubGoalId, SubGoalRow>,
    actions: HashMap<ActionId, ActionRow>,
    tasks: HashMap<TaskId, TaskRow>,
    history: Vec<ProgressHistoryEntry>,
}

impl State {
    fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|row| Task {
            id: id.clone(),
            action_id: row.action_id.clone(),
            status: row.status,
        })
    }

    fn action(&self, id: &ActionId) -> Option<Action> {
        let row = self.actions.get(id)?;
        Some(Action {
            id: id.clone(),
            sub_goal_id: row.sub_goal_id.clone(),
            kind: row.kind,
            progress: row.progress,
            achieved_at: row.achieved_at,
            version: row.version,
            tasks: row.tasks.iter().filter_map(|t| self.task(t)).collect(),
        })
    }

    fn sub_goal(&self, id: &SubGoalId) -> Option<SubGoal> {
        let row = self.sub_goals.get(id)?;
        Some(SubGoal {
            id: id.clone(),
            goal_id: row.goal_id.clone(),
            progress: row.progress,
            version: row.version,
            actions: row.actions.iter().filter_map(|a| self.action(a)).collect(),
        })
    }

    fn goal(&self, id: &GoalId) -> Option<Goal> {
        let row = self.goals.get(id)?;
        Some(Goal {
            id: id.clone(),
            progress: row.progress,
            completed_at: row.completed_at,
            version: row.version,
            sub_goals: row
                .sub_goals
                .iter()
                .filter_map(|s| self.sub_goal(s))
                .collect(),
        })
    }

    fn insert_goal(&mut self, goal: &Goal) {
        for sub in &goal.sub_goals {
            for action in &sub.actions {
                for task in &action.tasks {
                    self.tasks.insert(
                        task.id.clone(),
                        TaskRow {
                            action_id: action.id.clone(),
                            status: task.status,
                        },
                    );
                }
                self.actions.insert(
                    action.id.clone(),
                    ActionRow {
                        sub_goal_id: sub.id.clone(),
                        kind: action.kind,
                        progress: action.progress,
                        achieved_at: action.achieved_at,
                        version: action.version,
                        tasks: action.tasks.iter().map(|t| t.id.clone()).collect(),
                    },
                );
            }
            self.sub_goals.insert(
                sub.id.clone(),
                SubGoalRow {
                    goal_id: goal.id.clone(),
                    progress: sub.progress,
                    version: sub.version,
                    actions: sub.actions.iter().map(|a| a.id.clone()).collect(),
                },
            );
        }
        self.goals.insert(
            goal.id.clone(),
            GoalRow {
                progress: goal.progress,
                completed_at: goal.completed_at,
                version: goal.version,
                sub_goals: goal.sub_goals.iter().map(|s| s.id.clone()).collect(),
            },
        );
    }

    /// Returns `(progress, version)` slots for a writable entity
    fn progress_slot(&mut self, entity: &EntityRef) -> Result<(&mut i32, &mut u64), StorageError> {
        let missing = || StorageError::MissingEntity {
            entity: entity.clone(),
        };
        match entity.entity_type {
            EntityType::Goal => self
                .goals
                .get_mut(&GoalId::from(entity.id.as_str()))
                .map(|r| (&mut r.progress, &mut r.version))
                .ok_or_else(missing),
            EntityType::SubGoal => self
                .sub_goals
                .get_mut(&SubGoalId::from(entity.id.as_str()))
                .map(|r| (&mut r.progress, &mut r.version))
                .ok_or_else(missing),
            EntityType::Action => self
                .actions
                .get_mut(&ActionId::from(entity.id.as_str()))
                .map(|r| (&mut r.progress, &mut r.version))
                .ok_or_else(missing),
            EntityType::Task => Err(StorageError::InvalidWrite(format!(
                "tasks carry no progress: {entity}"
            ))),
        }
    }

    fn version_of(&self, entity: &EntityRef) -> Result<u64, StorageError> {
        let id = entity.id.as_str();
        let version = match entity.entity_type {
            EntityType::Goal => self.goals.get(&GoalId::from(id)).map(|r| r.version),
            EntityType::SubGoal => self.sub_goals.get(&SubGoalId::from(id)).map(|r| r.version),
            EntityType::Action => self.actions.get(&ActionId::from(id)).map(|r| r.version),
            EntityType::Task => {
                return Err(StorageError::InvalidWrite(format!(
                    "tasks carry no progress: {entity}"
                )));
            }
        };
        version.ok_or_else(|| StorageError::MissingEntity {
            entity: entity.clone(),
        })
    }

    fn has_marker(&self, entity: &EntityRef) -> Result<(), StorageError> {
        let id = entity.id.as_str();
        let exists = match entity.entity_type {
            EntityType::Goal => self.goals.contains_key(&GoalId::from(id)),
            EntityType::Action => self.actions.contains_key(&ActionId::from(id)),
            EntityType::SubGoal | EntityType::Task => {
                return Err(StorageError::InvalidWrite(format!("no marker on {entity}")));
            }
        };
        if exists {
            Ok(())
        } else {
            Err(StorageError::MissingEntity {
                entity: entity.clone(),
            })
        }
    }

    fn marker_slot(
        &mut self,
        entity: &EntityRef,
    ) -> Result<&mut Option<DateTime<Utc>>, StorageError> {
        let missing = || StorageError::MissingEntity {
            entity: entity.clone(),
        };
        match entity.entity_type {
            EntityType::Goal => self
                .goals
                .get_mut(&GoalId::from(entity.id.as_str()))
                .map(|r| &mut r.completed_at)
                .ok_or_else(missing),
            EntityType::Action => self
                .actions
                .get_mut(&ActionId::from(entity.id.as_str()))
                .map(|r| &mut r.achieved_at)
                .ok_or_else(missing),
            EntityType::SubGoal | EntityType::Task => Err(StorageError::InvalidWrite(format!(
                "no marker on {entity}"
            ))),
        }
    }
}

/// Pure in-memory [`ProgressStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    fail_points: Mutex<Vec<FailPoint>>,
    reads: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a goal subtree, replacing rows with the same IDs
    pub fn insert_goal(&self, goal: &Goal) {
        self.state.write().insert_goal(goal);
    }

    /// Change a task status (the request layer's job in production)
    ///
    /// # Errors
    /// `MissingEntity` if the task does not exist
    pub fn set_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let row = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::MissingEntity {
                entity: EntityRef::task(id),
            })?;
        row.status = status;
        Ok(())
    }

    /// Delete a single row, leaving its children pointing at nothing
    ///
    /// Returns whether the row existed.
    pub fn remove(&self, entity: &EntityRef) -> bool {
        let mut state = self.state.write();
        let id = entity.id.as_str();
        match entity.entity_type {
            EntityType::Goal => state.goals.remove(&GoalId::from(id)).is_some(),
            EntityType::SubGoal => state.sub_goals.remove(&SubGoalId::from(id)).is_some(),
            EntityType::Action => state.actions.remove(&ActionId::from(id)).is_some(),
            EntityType::Task => state.tasks.remove(&TaskId::from(id)).is_some(),
        }
    }

    /// Make every matching operation fail until [`MemoryStore::clear_failures`]
    pub fn inject_failure(&self, point: FailPoint) {
        self.fail_points.lock().push(point);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.fail_points.lock().clear();
    }

    /// Number of load calls served so far
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful commits so far
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Total number of history entries held
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    fn check(&self, point: FailPoint) -> Result<(), StorageError> {
        if self.fail_points.lock().contains(&point) {
            return Err(StorageError::Injected(format!("{point:?}")));
        }
        Ok(())
    }

    fn begin_read(&self) -> Result<(), StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check(FailPoint::Read)
    }

    /// Check a whole batch against the current state without changing it
    ///
    /// Guarded writes see the version bumps of earlier writes in the batch.
    fn check_batch(&self, state: &State, writes: &[Write]) -> Result<(), StorageError> {
        let mut bumps: HashMap<&EntityRef, u64> = HashMap::new();
        for write in writes {
            match write {
                Write::Progress {
                    entity,
                    expected_version,
                    ..
                } => {
                    self.check(FailPoint::ProgressWrite(entity.entity_type))?;
                    let stored = state.version_of(entity)?;
                    let pending = bumps.entry(entity).or_insert(0);
                    if let Some(expected) = *expected_version {
                        if stored + *pending != expected {
                            return Err(StorageError::Conflict {
                                entity: entity.clone(),
                                expected,
                            });
                        }
                    }
                    *pending += 1;
                }
                Write::Marker { entity, .. } => {
                    self.check(FailPoint::MarkerWrite)?;
                    state.has_marker(entity)?;
                }
                Write::History(_) => self.check(FailPoint::HistoryAppend)?,
            }
        }
        Ok(())
    }

    fn apply(state: &mut State, write: Write) -> Result<(), StorageError> {
        match write {
            Write::Progress {
                entity, progress, ..
            } => {
                let (slot, version) = state.progress_slot(&entity)?;
                *slot = progress;
                *version += 1;
            }
            Write::Marker { entity, at } => {
                *state.marker_slot(&entity)? = at;
            }
            Write::History(entry) => state.history.push(entry),
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load_goal(&self, id: &GoalId) -> Result<Option<Goal>, StorageError> {
        self.begin_read()?;
        Ok(self.state.read().goal(id))
    }

    async fn load_sub_goal(&self, id: &SubGoalId) -> Result<Option<SubGoal>, StorageError> {
        self.begin_read()?;
        Ok(self.state.read().sub_goal(id))
    }

    async fn load_action(&self, id: &ActionId) -> Result<Option<Action>, StorageError> {
        self.begin_read()?;
        Ok(self.state.read().action(id))
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        self.begin_read()?;
        Ok(self.state.read().task(id))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let writes = batch.into_writes();
        let mut state = self.state.write();
        self.check_batch(&state, &writes)?;
        for write in writes {
            Self::apply(&mut state, write)?;
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn history_entries(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ProgressHistoryEntry>, StorageError> {
        self.begin_read()?;
        let mut entries: Vec<_> = self
            .state
            .read()
            .history
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        // Stable: equal timestamps keep append order.
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        self.check(FailPoint::Purge)?;
        let mut state = self.state.write();
        let before = state.history.len();
        state.history.retain(|e| e.timestamp >= cutoff);
        Ok((before - state.history.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryStore, Goal) {
        let mut goal = Goal::new();
        let mut sub = SubGoal::new(goal.id.clone());
        let mut action = Action::new(sub.id.clone(), ActionKind::Execution);
        action
            .tasks
            .push(Task::new(action.id.clone(), TaskStatus::Completed));
        sub.actions.push(action);
        goal.sub_goals.push(sub);

        let store = MemoryStore::new();
        store.insert_goal(&goal);
        (store, goal)
    }

    #[tokio::test]
    async fn loads_return_seeded_tree() {
        let (store, goal) = seeded();
        let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
        assert_eq!(loaded, goal);

        let action = goal.actions().next().unwrap();
        let task = &action.tasks[0];
        assert_eq!(store.load_task(&task.id).await.unwrap().unwrap(), *task);
        assert_eq!(store.read_count(), 2);
        assert!(store
            .load_goal(&GoalId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failing_write_discards_whole_batch() {
        let (store, goal) = seeded();
        let sub = &goal.sub_goals[0];
        store.inject_failure(FailPoint::ProgressWrite(EntityType::Goal));

        let mut batch = WriteBatch::new();
        batch
            .set_progress(sub.entity_ref(), 80)
            .set_progress(goal.entity_ref(), 80);
        assert!(matches!(
            store.commit(batch).await,
            Err(StorageError::Injected(_))
        ));

        let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
        assert_eq!(loaded.sub_goals[0].progress, 0);
        assert_eq!(loaded.sub_goals[0].version, 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn guarded_write_detects_version_change() {
        let (store, goal) = seeded();

        let mut first = WriteBatch::new();
        first.set_progress_guarded(goal.entity_ref(), 10, 0);
        store.commit(first).await.unwrap();

        let mut stale = WriteBatch::new();
        stale.set_progress_guarded(goal.entity_ref(), 20, 0);
        let err = store.commit(stale).await.unwrap_err();
        assert!(err.is_retryable());

        let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 10);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn late_failure_in_batch_leaves_history_untouched() {
        let (store, goal) = seeded();
        let action = goal.actions().next().unwrap();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        batch
            .set_progress(goal.entity_ref(), 50)
            .append_history(ProgressHistoryEntry::new(&goal.entity_ref(), 50, now))
            .set_marker(action.entity_ref(), Some(now))
            .set_progress(EntityRef::new(EntityType::Action, "gone"), 1);
        assert!(matches!(
            store.commit(batch).await,
            Err(StorageError::MissingEntity { .. })
        ));

        let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
        assert_eq!(loaded, goal);
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn guarded_writes_in_one_batch_see_earlier_bumps() {
        let (store, goal) = seeded();

        let mut batch = WriteBatch::new();
        batch
            .set_progress_guarded(goal.entity_ref(), 10, 0)
            .set_progress_guarded(goal.entity_ref(), 20, 1);
        store.commit(batch).await.unwrap();

        let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 20);
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn task_progress_write_is_rejected() {
        let (store, goal) = seeded();
        let task = &goal.actions().next().unwrap().tasks[0];
        let mut batch = WriteBatch::new();
        batch.set_progress(EntityRef::task(&task.id), 1);
        assert!(matches!(
            store.commit(batch).await,
            Err(StorageError::InvalidWrite(_))
        ));
    }

    #[tokio::test]
    async fn markers_and_task_status() {
        let (store, goal) = seeded();
        let action = goal.actions().next().unwrap();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        batch.set_marker(action.entity_ref(), Some(now));
        store.commit(batch).await.unwrap();
        let loaded = store.load_action(&action.id).await.unwrap().unwrap();
        assert_eq!(loaded.achieved_at, Some(now));

        store
            .set_task_status(&action.tasks[0].id, TaskStatus::Skipped)
            .unwrap();
        let task = store.load_task(&action.tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert!(store
            .set_task_status(&TaskId::from("nope"), TaskStatus::Completed)
            .is_err());
    }

    #[tokio::test]
    async fn history_is_ordered_and_purgeable() {
        let (store, goal) = seeded();
        let entity = goal.entity_ref();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        batch
            .append_history(ProgressHistoryEntry::new(&entity, 30, now))
            .append_history(ProgressHistoryEntry::new(&entity, 10, now - chrono::Duration::days(40)))
            .append_history(ProgressHistoryEntry::new(&entity, 20, now - chrono::Duration::days(2)));
        store.commit(batch).await.unwrap();

        let all = store
            .history_entries(&HistoryQuery::for_entity(&entity))
            .await
            .unwrap();
        let values: Vec<u8> = all.iter().map(|e| e.progress).collect();
        assert_eq!(values, vec![10, 20, 30]);

        let removed = store
            .purge_history_before(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.history_len(), 2);
    }
}
