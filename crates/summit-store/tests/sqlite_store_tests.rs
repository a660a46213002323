//! SQLite store behaviour
//!
//! Run with: cargo test --package summit-store --test sqlite_store_tests

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use summit_model::{
    Action, ActionKind, EntityRef, Goal, GoalId, ProgressHistoryEntry, SubGoal, Task, TaskStatus,
};
use summit_store::{HistoryQuery, ProgressStore, SqliteStore, StorageError, WriteBatch};

fn at_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn sample_goal() -> Goal {
    let mut goal = Goal::new();
    for kind in [ActionKind::Execution, ActionKind::Habit] {
        let mut sub = SubGoal::new(goal.id.clone());
        for n in 0..2 {
            let mut action = Action::new(sub.id.clone(), kind);
            for i in 0..3 {
                let status = if i <= n {
                    TaskStatus::Completed
                } else {
                    TaskStatus::NotStarted
                };
                action.tasks.push(Task::new(action.id.clone(), status));
            }
            sub.actions.push(action);
        }
        goal.sub_goals.push(sub);
    }
    goal
}

#[tokio::test]
async fn seeded_tree_loads_back_in_order() {
    let store = SqliteStore::in_memory().await.unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();

    let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(loaded, goal);

    let sub = &goal.sub_goals[1];
    assert_eq!(store.load_sub_goal(&sub.id).await.unwrap().unwrap(), *sub);

    let action = &sub.actions[0];
    assert_eq!(store.load_action(&action.id).await.unwrap().unwrap(), *action);

    let task = &action.tasks[2];
    assert_eq!(store.load_task(&task.id).await.unwrap().unwrap(), *task);
}

#[tokio::test]
async fn missing_entities_load_as_none() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert!(store.load_goal(&GoalId::from("nope")).await.unwrap().is_none());
    assert!(store
        .load_task(&summit_model::TaskId::from("nope"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn commit_applies_progress_markers_and_history() {
    let store = SqliteStore::in_memory().await.unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();
    let action = &goal.sub_goals[0].actions[0];
    let when = at_millis(1_700_000_000_000);

    let mut batch = WriteBatch::new();
    batch
        .set_progress_guarded(action.entity_ref(), 100, 0)
        .set_marker(action.entity_ref(), Some(when))
        .append_history(
            ProgressHistoryEntry::new(&action.entity_ref(), 100, when).with_reason("test"),
        );
    store.commit(batch).await.unwrap();

    let loaded = store.load_action(&action.id).await.unwrap().unwrap();
    assert_eq!(loaded.progress, 100);
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.achieved_at, Some(when));

    let history = store
        .history_entries(&HistoryQuery::for_entity(&action.entity_ref()))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_reason.as_deref(), Some("test"));
    assert_eq!(history[0].timestamp, when);
}

#[tokio::test]
async fn stale_version_rolls_back_the_whole_batch() {
    let store = SqliteStore::in_memory().await.unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();
    let sub = &goal.sub_goals[0];

    let mut batch = WriteBatch::new();
    batch
        .set_progress_guarded(sub.entity_ref(), 40, 0)
        .append_history(ProgressHistoryEntry::new(&sub.entity_ref(), 40, Utc::now()))
        .set_progress_guarded(goal.entity_ref(), 40, 7);

    let err = store.commit(batch).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict { expected: 7, .. }));
    assert!(err.is_retryable());

    let loaded = store.load_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(loaded.sub_goals[0].progress, 0);
    assert_eq!(loaded.sub_goals[0].version, 0);
    let history = store
        .history_entries(&HistoryQuery::for_entity(&sub.entity_ref()))
        .await
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn write_to_unknown_entity_is_missing() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut batch = WriteBatch::new();
    batch.set_progress(EntityRef::goal(&GoalId::from("ghost")), 10);
    assert!(matches!(
        store.commit(batch).await,
        Err(StorageError::MissingEntity { .. })
    ));
}

#[tokio::test]
async fn history_window_and_purge() {
    let store = SqliteStore::in_memory().await.unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();
    let entity = goal.entity_ref();
    let now = at_millis(1_700_000_000_000);

    let mut batch = WriteBatch::new();
    for (days_ago, progress) in [(45, 5), (20, 25), (3, 50), (0, 60)] {
        batch.append_history(ProgressHistoryEntry::new(
            &entity,
            progress,
            now - Duration::days(days_ago),
        ));
    }
    store.commit(batch).await.unwrap();

    let recent = store
        .history_entries(&HistoryQuery::for_entity(&entity).since(now - Duration::days(7)))
        .await
        .unwrap();
    let values: Vec<u8> = recent.iter().map(|e| e.progress).collect();
    assert_eq!(values, vec![50, 60]);

    let removed = store
        .purge_history_before(now - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = store
        .history_entries(&HistoryQuery::for_entity(&entity))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 3);
}

#[tokio::test]
async fn task_status_updates_persist() {
    let store = SqliteStore::in_memory().await.unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();
    let task = &goal.sub_goals[0].actions[0].tasks[2];

    store
        .set_task_status(&task.id, TaskStatus::Completed)
        .await
        .unwrap();
    let loaded = store.load_task(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Completed);
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.sqlite3");
    let goal = sample_goal();
    {
        let store = SqliteStore::open(&path).await.unwrap();
        store.insert_goal(&goal).await.unwrap();
    }

    let reopened = SqliteStore::open(&path).await.unwrap();
    let loaded = reopened.load_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(loaded.sub_goals.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loads_never_mix_rows_across_a_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("snapshot.sqlite3"))
        .await
        .unwrap();
    let goal = sample_goal();
    store.insert_goal(&goal).await.unwrap();

    // Every batch moves the goal, both subgoals and one action of each to
    // the same value, so any consistent snapshot shows them equal.
    let writer = {
        let store = store.clone();
        let goal = goal.clone();
        tokio::spawn(async move {
            for progress in 1..=100 {
                let mut batch = WriteBatch::new();
                batch.set_progress(goal.entity_ref(), progress);
                for sub in &goal.sub_goals {
                    batch
                        .set_progress(sub.entity_ref(), progress)
                        .set_progress(sub.actions[0].entity_ref(), progress);
                }
                store.commit(batch).await.unwrap();
            }
        })
    };

    let sub = &goal.sub_goals[1];
    let mut loads = 0;
    while !writer.is_finished() || loads == 0 {
        let tree = store.load_goal(&goal.id).await.unwrap().unwrap();
        for loaded_sub in &tree.sub_goals {
            assert_eq!(loaded_sub.progress, tree.progress);
            assert_eq!(loaded_sub.actions[0].progress, tree.progress);
        }

        let loaded_sub = store.load_sub_goal(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded_sub.actions[0].progress, loaded_sub.progress);
        loads += 1;
    }
    writer.await.unwrap();

    let last = store.load_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(last.progress, 100);
    assert_eq!(last.sub_goals[0].actions[0].version, 100);
}
