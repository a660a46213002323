//! SQLite store
//!
//! Durable [`ProgressStore`] on top of `sqlx`. A batch commit runs inside
//! one transaction; guarded progress writes are `UPDATE ... WHERE version = ?`
//! so a concurrent cascade that committed first turns into a
//! [`StorageError::Conflict`] and the whole transaction rolls back.
//!
//! Loads that span several tables read inside one transaction, so under WAL
//! they see a single snapshot and never mix rows from before and after a
//! concurrent commit.
//!
//! Timestamps are stored as Unix milliseconds.

use crate::error::StorageError;
use crate::store::{HistoryQuery, ProgressStore, Write, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use summit_model::{
    Action, ActionId, ActionKind, EntityRef, EntityType, Goal, GoalId, ProgressHistoryEntry,
    SubGoal, SubGoalId, Task, TaskId, TaskStatus,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS goals (
    id           TEXT PRIMARY KEY,
    progress     INTEGER NOT NULL DEFAULT 0,
    completed_at INTEGER,
    version      INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sub_goals (
    id       TEXT PRIMARY KEY,
    goal_id  TEXT NOT NULL REFERENCES goals(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    version  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS actions (
    id          TEXT PRIMARY KEY,
    sub_goal_id TEXT NOT NULL REFERENCES sub_goals(id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    kind        TEXT NOT NULL CHECK (kind IN ('execution', 'habit')),
    progress    INTEGER NOT NULL DEFAULT 0,
    achieved_at INTEGER,
    version     INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tasks (
    id        TEXT PRIMARY KEY,
    action_id TEXT NOT NULL REFERENCES actions(id) ON DELETE CASCADE,
    position  INTEGER NOT NULL,
    status    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS progress_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id     TEXT NOT NULL,
    entity_type   TEXT NOT NULL,
    progress      INTEGER NOT NULL,
    recorded_at   INTEGER NOT NULL,
    change_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_sub_goals_goal ON sub_goals(goal_id, position);
CREATE INDEX IF NOT EXISTS idx_actions_sub_goal ON actions(sub_goal_id, position);
CREATE INDEX IF NOT EXISTS idx_tasks_action ON tasks(action_id, position);
CREATE INDEX IF NOT EXISTS idx_history_entity ON progress_history(entity_type, entity_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_history_recorded ON progress_history(recorded_at)
";

const SELECT_ACTIONS: &str =
    "SELECT a.id, a.sub_goal_id, a.kind, a.progress, a.achieved_at, a.version FROM actions a";
const SELECT_TASKS: &str = "SELECT t.id, t.action_id, t.status FROM tasks t";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let retryable = match &err {
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
            }
            sqlx::Error::PoolTimedOut => true,
            _ => false,
        };
        StorageError::Backend {
            message: err.to_string(),
            retryable,
        }
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(format!("{what}: {detail}"))
}

fn millis_to_time(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(|ms| DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt("timestamp", ms)))
        .transpose()
}

fn progress_column(value: i64) -> Result<i32, StorageError> {
    i32::try_from(value).map_err(|_| corrupt("progress", value))
}

fn version_column(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| corrupt("version", value))
}

fn version_param(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::InvalidWrite(format!("version {value}")))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: TaskId::from(row.try_get::<String, _>("id")?),
        action_id: ActionId::from(row.try_get::<String, _>("action_id")?),
        status: TaskStatus::from_str(&status).map_err(|e| corrupt("task status", e))?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<Action, StorageError> {
    let kind: String = row.try_get("kind")?;
    Ok(Action {
        id: ActionId::from(row.try_get::<String, _>("id")?),
        sub_goal_id: SubGoalId::from(row.try_get::<String, _>("sub_goal_id")?),
        kind: ActionKind::from_str(&kind).map_err(|e| corrupt("action kind", e))?,
        progress: progress_column(row.try_get("progress")?)?,
        achieved_at: millis_to_time(row.try_get("achieved_at")?)?,
        version: version_column(row.try_get("version")?)?,
        tasks: Vec::new(),
    })
}

fn sub_goal_from_row(row: &SqliteRow) -> Result<SubGoal, StorageError> {
    Ok(SubGoal {
        id: SubGoalId::from(row.try_get::<String, _>("id")?),
        goal_id: GoalId::from(row.try_get::<String, _>("goal_id")?),
        progress: progress_column(row.try_get("progress")?)?,
        version: version_column(row.try_get("version")?)?,
        actions: Vec::new(),
    })
}

fn history_from_row(row: &SqliteRow) -> Result<ProgressHistoryEntry, StorageError> {
    let entity_type: String = row.try_get("entity_type")?;
    let progress: i64 = row.try_get("progress")?;
    let recorded_at: i64 = row.try_get("recorded_at")?;
    Ok(ProgressHistoryEntry {
        entity_id: row.try_get("entity_id")?,
        entity_type: EntityType::from_str(&entity_type).map_err(|e| corrupt("entity type", e))?,
        progress: u8::try_from(progress).map_err(|_| corrupt("history progress", progress))?,
        timestamp: millis_to_time(Some(recorded_at))?
            .ok_or_else(|| corrupt("timestamp", recorded_at))?,
        change_reason: row.try_get("change_reason")?,
    })
}

fn attach_tasks(actions: &mut [Action], tasks: Vec<Task>) {
    let mut by_action: HashMap<ActionId, Vec<Task>> = HashMap::new();
    for task in tasks {
        by_action.entry(task.action_id.clone()).or_default().push(task);
    }
    for action in actions {
        action.tasks = by_action.remove(&action.id).unwrap_or_default();
    }
}

fn attach_actions(sub_goals: &mut [SubGoal], actions: Vec<Action>) {
    let mut by_sub_goal: HashMap<SubGoalId, Vec<Action>> = HashMap::new();
    for action in actions {
        by_sub_goal
            .entry(action.sub_goal_id.clone())
            .or_default()
            .push(action);
    }
    for sub in sub_goals {
        sub.actions = by_sub_goal.remove(&sub.id).unwrap_or_default();
    }
}

fn progress_table(entity: &EntityRef) -> Result<&'static str, StorageError> {
    match entity.entity_type {
        EntityType::Goal => Ok("goals"),
        EntityType::SubGoal => Ok("sub_goals"),
        EntityType::Action => Ok("actions"),
        EntityType::Task => Err(StorageError::InvalidWrite(format!(
            "tasks carry no progress: {entity}"
        ))),
    }
}

/// SQLite-backed [`ProgressStore`]
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema
    ///
    /// # Errors
    /// Backend error if the file cannot be opened or migrated
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        tracing::info!(path = %path.as_ref().display(), "opened progress database");

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    ///
    /// # Errors
    /// Backend error if the connection cannot be created
    pub async fn in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // One long-lived connection: every new in-memory connection is a new database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool; call [`SqliteStore::migrate`] before use
    #[inline]
    #[must_use]
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if missing
    ///
    /// # Errors
    /// Backend error on any failing statement
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Seed a goal subtree
    ///
    /// # Errors
    /// Backend error if any row already exists
    pub async fn insert_goal(&self, goal: &Goal) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO goals (id, progress, completed_at, version) VALUES (?, ?, ?, ?)")
            .bind(goal.id.as_str())
            .bind(goal.progress)
            .bind(goal.completed_at.map(|t| t.timestamp_millis()))
            .bind(version_param(goal.version)?)
            .execute(&mut *tx)
            .await?;

        for (sub_pos, sub) in goal.sub_goals.iter().enumerate() {
            sqlx::query(
                "INSERT INTO sub_goals (id, goal_id, position, progress, version) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(sub.id.as_str())
            .bind(goal.id.as_str())
            .bind(sub_pos as i64)
            .bind(sub.progress)
            .bind(version_param(sub.version)?)
            .execute(&mut *tx)
            .await?;

            for (action_pos, action) in sub.actions.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO actions (id, sub_goal_id, position, kind, progress, achieved_at, version)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(action.id.as_str())
                .bind(sub.id.as_str())
                .bind(action_pos as i64)
                .bind(action.kind.as_str())
                .bind(action.progress)
                .bind(action.achieved_at.map(|t| t.timestamp_millis()))
                .bind(version_param(action.version)?)
                .execute(&mut *tx)
                .await?;

                for (task_pos, task) in action.tasks.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO tasks (id, action_id, position, status) VALUES (?, ?, ?, ?)",
                    )
                    .bind(task.id.as_str())
                    .bind(action.id.as_str())
                    .bind(task_pos as i64)
                    .bind(task.status.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Change a task status (the request layer's job in production)
    ///
    /// # Errors
    /// `MissingEntity` if the task does not exist
    pub async fn set_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::MissingEntity {
                entity: EntityRef::task(id),
            });
        }
        Ok(())
    }

    async fn fetch_tasks(
        conn: &mut SqliteConnection,
        filter: &str,
        key: &str,
    ) -> Result<Vec<Task>, StorageError> {
        let sql = format!("{SELECT_TASKS} {filter} ORDER BY t.position, t.id");
        let rows = sqlx::query(&sql).bind(key).fetch_all(conn).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn fetch_actions(
        conn: &mut SqliteConnection,
        filter: &str,
        key: &str,
    ) -> Result<Vec<Action>, StorageError> {
        let sql = format!("{SELECT_ACTIONS} {filter} ORDER BY a.position, a.id");
        let rows = sqlx::query(&sql).bind(key).fetch_all(conn).await?;
        rows.iter().map(action_from_row).collect()
    }

    async fn apply(tx: &mut Transaction<'_, Sqlite>, write: Write) -> Result<(), StorageError> {
        match write {
            Write::Progress {
                entity,
                progress,
                expected_version,
            } => {
                let table = progress_table(&entity)?;
                let result = match expected_version {
                    Some(expected) => {
                        let sql = format!(
                            "UPDATE {table} SET progress = ?, version = version + 1 WHERE id = ? AND version = ?"
                        );
                        sqlx::query(&sql)
                            .bind(progress)
                            .bind(&entity.id)
                            .bind(version_param(expected)?)
                            .execute(&mut **tx)
                            .await?
                    }
                    None => {
                        let sql = format!(
                            "UPDATE {table} SET progress = ?, version = version + 1 WHERE id = ?"
                        );
                        sqlx::query(&sql)
                            .bind(progress)
                            .bind(&entity.id)
                            .execute(&mut **tx)
                            .await?
                    }
                };

                if result.rows_affected() == 0 {
                    let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
                    let exists = sqlx::query(&sql)
                        .bind(&entity.id)
                        .fetch_optional(&mut **tx)
                        .await?
                        .is_some();
                    return Err(match expected_version {
                        Some(expected) if exists => StorageError::Conflict { entity, expected },
                        _ => StorageError::MissingEntity { entity },
                    });
                }
            }
            Write::Marker { entity, at } => {
                let sql = match entity.entity_type {
                    EntityType::Goal => "UPDATE goals SET completed_at = ? WHERE id = ?",
                    EntityType::Action => "UPDATE actions SET achieved_at = ? WHERE id = ?",
                    EntityType::SubGoal | EntityType::Task => {
                        return Err(StorageError::InvalidWrite(format!("no marker on {entity}")));
                    }
                };
                let result = sqlx::query(sql)
                    .bind(at.map(|t| t.timestamp_millis()))
                    .bind(&entity.id)
                    .execute(&mut **tx)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::MissingEntity { entity });
                }
            }
            Write::History(entry) => {
                sqlx::query(
                    "INSERT INTO progress_history (entity_id, entity_type, progress, recorded_at, change_reason)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&entry.entity_id)
                .bind(entry.entity_type.as_str())
                .bind(i64::from(entry.progress))
                .bind(entry.timestamp.timestamp_millis())
                .bind(entry.change_reason.as_deref())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn load_goal(&self, id: &GoalId) -> Result<Option<Goal>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let Some(row) =
            sqlx::query("SELECT id, progress, completed_at, version FROM goals WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(None);
        };

        let sub_rows = sqlx::query(
            "SELECT id, goal_id, progress, version FROM sub_goals WHERE goal_id = ? ORDER BY position, id",
        )
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let mut sub_goals = sub_rows
            .iter()
            .map(sub_goal_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut actions = Self::fetch_actions(
            &mut tx,
            "JOIN sub_goals s ON a.sub_goal_id = s.id WHERE s.goal_id = ?",
            id.as_str(),
        )
        .await?;
        let tasks = Self::fetch_tasks(
            &mut tx,
            "JOIN actions a ON t.action_id = a.id JOIN sub_goals s ON a.sub_goal_id = s.id WHERE s.goal_id = ?",
            id.as_str(),
        )
        .await?;
        tx.commit().await?;

        attach_tasks(&mut actions, tasks);
        attach_actions(&mut sub_goals, actions);

        Ok(Some(Goal {
            id: id.clone(),
            progress: progress_column(row.try_get("progress")?)?,
            completed_at: millis_to_time(row.try_get("completed_at")?)?,
            version: version_column(row.try_get("version")?)?,
            sub_goals,
        }))
    }

    async fn load_sub_goal(&self, id: &SubGoalId) -> Result<Option<SubGoal>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let Some(row) =
            sqlx::query("SELECT id, goal_id, progress, version FROM sub_goals WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(None);
        };
        let mut sub_goal = sub_goal_from_row(&row)?;

        let mut actions = Self::fetch_actions(&mut tx, "WHERE a.sub_goal_id = ?", id.as_str()).await?;
        let tasks = Self::fetch_tasks(
            &mut tx,
            "JOIN actions a ON t.action_id = a.id WHERE a.sub_goal_id = ?",
            id.as_str(),
        )
        .await?;
        tx.commit().await?;

        attach_tasks(&mut actions, tasks);
        sub_goal.actions = actions;
        Ok(Some(sub_goal))
    }

    async fn load_action(&self, id: &ActionId) -> Result<Option<Action>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut actions = Self::fetch_actions(&mut tx, "WHERE a.id = ?", id.as_str()).await?;
        let Some(mut action) = actions.pop() else {
            return Ok(None);
        };
        action.tasks = Self::fetch_tasks(&mut tx, "WHERE t.action_id = ?", id.as_str()).await?;
        tx.commit().await?;
        Ok(Some(action))
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let mut tasks = Self::fetch_tasks(&mut conn, "WHERE t.id = ?", id.as_str()).await?;
        Ok(tasks.pop())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for write in batch.into_writes() {
            if let Err(err) = Self::apply(&mut tx, write).await {
                if let Err(rb) = tx.rollback().await {
                    tracing::error!(error = %rb, "progress batch rollback failed");
                }
                return Err(err);
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn history_entries(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ProgressHistoryEntry>, StorageError> {
        let start = query.start.map_or(i64::MIN, |t| t.timestamp_millis());
        let end = query.end.map_or(i64::MAX, |t| t.timestamp_millis());
        let rows = sqlx::query(
            "SELECT entity_id, entity_type, progress, recorded_at, change_reason
             FROM progress_history
             WHERE entity_type = ? AND entity_id = ? AND recorded_at >= ? AND recorded_at <= ?
             ORDER BY recorded_at ASC, id ASC",
        )
        .bind(query.entity_type.as_str())
        .bind(&query.entity_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM progress_history WHERE recorded_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
