//! Cache ordering when cascades and reads interleave
//!
//! Run with: cargo test --package summit-engine --test cache_ordering_tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use summit_engine::{EngineConfig, ProgressEngine};
use summit_model::{
    Action, ActionId, ActionKind, Goal, GoalId, ProgressHistoryEntry, SubGoal, SubGoalId, Task,
    TaskId, TaskStatus,
};
use summit_store::{HistoryQuery, MemoryStore, ProgressStore, StorageError, WriteBatch};
use summit_test_utils::{build_goal, fixed_start};
use tokio::sync::Notify;

/// Where the next call should stop and wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    AfterCommit,
    AfterGoalLoad,
}

/// Memory store that parks one call at a chosen point until released
#[derive(Debug, Default)]
struct GatedStore {
    inner: MemoryStore,
    hold: Mutex<Option<Hold>>,
    parked: Notify,
    release: Notify,
}

impl GatedStore {
    fn arm(&self, hold: Hold) {
        *self.hold.lock() = Some(hold);
    }

    async fn pause_at(&self, point: Hold) {
        let hit = {
            let mut hold = self.hold.lock();
            if *hold == Some(point) {
                *hold = None;
                true
            } else {
                false
            }
        };
        if hit {
            self.parked.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl ProgressStore for GatedStore {
    async fn load_goal(&self, id: &GoalId) -> Result<Option<Goal>, StorageError> {
        let goal = self.inner.load_goal(id).await?;
        self.pause_at(Hold::AfterGoalLoad).await;
        Ok(goal)
    }

    async fn load_sub_goal(&self, id: &SubGoalId) -> Result<Option<SubGoal>, StorageError> {
        self.inner.load_sub_goal(id).await
    }

    async fn load_action(&self, id: &ActionId) -> Result<Option<Action>, StorageError> {
        self.inner.load_action(id).await
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        self.inner.load_task(id).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.inner.commit(batch).await?;
        self.pause_at(Hold::AfterCommit).await;
        Ok(())
    }

    async fn history_entries(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ProgressHistoryEntry>, StorageError> {
        self.inner.history_entries(query).await
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        self.inner.purge_history_before(cutoff).await
    }
}

/// One execution action with four open tasks behind a gated store
fn setup() -> (Arc<GatedStore>, Arc<ProgressEngine>, Goal) {
    let goal = build_goal(&[&[(ActionKind::Execution, 0, 4)]]);
    let store = Arc::new(GatedStore::default());
    store.inner.insert_goal(&goal);
    let clock = Arc::new(summit_model::ManualClock::new(fixed_start()));
    let engine =
        ProgressEngine::with_clock(store.clone(), clock, EngineConfig::default()).unwrap();
    (store, Arc::new(engine), goal)
}

fn task(goal: &Goal, index: usize) -> TaskId {
    goal.sub_goals[0].actions[0].tasks[index].id.clone()
}

#[tokio::test]
async fn earlier_cascade_caching_last_keeps_newer_value() {
    let (store, engine, goal) = setup();
    let first = task(&goal, 0);
    let second = task(&goal, 1);

    store
        .inner
        .set_task_status(&first, TaskStatus::Completed)
        .unwrap();
    store.arm(Hold::AfterCommit);
    let early = tokio::spawn({
        let engine = engine.clone();
        async move { engine.recalculate_from_task(&first).await }
    });
    store.parked.notified().await;

    // The first cascade has committed but not touched the cache yet.
    store
        .inner
        .set_task_status(&second, TaskStatus::Completed)
        .unwrap();
    let late = engine.recalculate_from_task(&second).await.unwrap();
    assert_eq!(late.goal.current, 50);

    store.release.notify_one();
    let early = early.await.unwrap().unwrap();
    assert_eq!(early.goal.current, 25);

    let stored = store.inner.load_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 50);
    let cached = engine.cache().get(&goal.entity_ref()).await.unwrap();
    assert_eq!(cached.progress, 50);
    assert_eq!(cached.version, stored.version);
    assert_eq!(engine.calculate_goal_progress(&goal.id).await.unwrap(), 50);

    let action = &goal.sub_goals[0].actions[0];
    assert_eq!(
        engine.calculate_action_progress(&action.id).await.unwrap(),
        50
    );
}

#[tokio::test]
async fn read_from_before_a_cascade_does_not_overwrite_it() {
    let (store, engine, goal) = setup();
    let first = task(&goal, 0);

    store.arm(Hold::AfterGoalLoad);
    let read = tokio::spawn({
        let engine = engine.clone();
        let goal_id = goal.id.clone();
        async move { engine.calculate_goal_progress(&goal_id).await }
    });
    store.parked.notified().await;

    // The read holds a snapshot with no task done.
    store
        .inner
        .set_task_status(&first, TaskStatus::Completed)
        .unwrap();
    let outcome = engine.recalculate_from_task(&first).await.unwrap();
    assert_eq!(outcome.goal.current, 25);

    store.release.notify_one();
    assert_eq!(read.await.unwrap().unwrap(), 0);

    assert_eq!(engine.calculate_goal_progress(&goal.id).await.unwrap(), 25);
    let sub = &goal.sub_goals[0];
    let cached = engine.cache().get(&sub.entity_ref()).await.unwrap();
    assert_eq!(cached.progress, 25);
}
