//! Core types for the goal hierarchy
//!
//! Defines the four-level decomposition and its supporting values:
//! - Identifiers for every level
//! - Goal, SubGoal, Action and Task nodes
//! - Entity references used as cache and history keys
//! - Progress history entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Upper bound of any progress value
pub const MAX_PROGRESS: u8 = 100;

/// Check whether a persisted progress value lies in `[0, 100]`
#[inline]
#[must_use]
pub fn is_valid_progress(value: i32) -> bool {
    (0..=i32::from(MAX_PROGRESS)).contains(&value)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier (ULID for sortability)
            #[inline]
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new().to_string())
            }

            /// Borrow the identifier as a string
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Goal identifier
    GoalId
);
define_id!(
    /// SubGoal identifier
    SubGoalId
);
define_id!(
    /// Action identifier
    ActionId
);
define_id!(
    /// Task identifier
    TaskId
);

/// Error returned when parsing an enum from its string form fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Level of a node in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Top-level goal
    Goal,
    /// Second level
    #[serde(rename = "subgoal")]
    SubGoal,
    /// Third level
    Action,
    /// Leaf
    Task,
}

impl EntityType {
    /// Stable string form used in storage and on the CLI
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Goal => "goal",
            EntityType::SubGoal => "subgoal",
            EntityType::Action => "action",
            EntityType::Task => "task",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "goal" => Ok(Self::Goal),
            "subgoal" | "sub_goal" => Ok(Self::SubGoal),
            "action" => Ok(Self::Action),
            "task" => Ok(Self::Task),
            _ => Err(ParseError::new("entity type", s)),
        }
    }
}

/// Reference to a single node: `(entity type, id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Hierarchy level
    pub entity_type: EntityType,
    /// Opaque identifier
    pub id: String,
}

impl EntityRef {
    /// Create a reference from parts
    #[inline]
    #[must_use]
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    /// Reference to a goal
    #[inline]
    #[must_use]
    pub fn goal(id: &GoalId) -> Self {
        Self::new(EntityType::Goal, id.as_str())
    }

    /// Reference to a subgoal
    #[inline]
    #[must_use]
    pub fn sub_goal(id: &SubGoalId) -> Self {
        Self::new(EntityType::SubGoal, id.as_str())
    }

    /// Reference to an action
    #[inline]
    #[must_use]
    pub fn action(id: &ActionId) -> Self {
        Self::new(EntityType::Action, id.as_str())
    }

    /// Reference to a task
    #[inline]
    #[must_use]
    pub fn task(id: &TaskId) -> Self {
        Self::new(EntityType::Task, id.as_str())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet
    #[default]
    NotStarted,
    /// Work underway
    InProgress,
    /// Done; the only status that counts toward progress
    Completed,
    /// Deliberately skipped
    Skipped,
}

impl TaskStatus {
    /// Whether the task counts as complete
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Stable string form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(ParseError::new("task status", s)),
        }
    }
}

/// Action kind, selects the aggregation formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Complete once its tasks are done
    #[default]
    Execution,
    /// Recurring behavior, fully established at 80% completion
    Habit,
}

impl ActionKind {
    /// Stable string form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Execution => "execution",
            ActionKind::Habit => "habit",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution" => Ok(Self::Execution),
            "habit" => Ok(Self::Habit),
            _ => Err(ParseError::new("action kind", s)),
        }
    }
}

/// Leaf node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID
    pub id: TaskId,
    /// Owning action
    pub action_id: ActionId,
    /// Current status
    pub status: TaskStatus,
}

impl Task {
    /// Create task with a fresh ID
    #[inline]
    #[must_use]
    pub fn new(action_id: ActionId, status: TaskStatus) -> Self {
        Self {
            id: TaskId::generate(),
            action_id,
            status,
        }
    }
}

/// Third-level node owning a variable number of tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Action ID
    pub id: ActionId,
    /// Owning subgoal
    pub sub_goal_id: SubGoalId,
    /// Aggregation formula selector; fixed at creation
    pub kind: ActionKind,
    /// Persisted progress
    pub progress: i32,
    /// Set when progress reaches 100
    pub achieved_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token
    pub version: u64,
    /// Owned tasks
    pub tasks: Vec<Task>,
}

impl Action {
    /// Create empty action with a fresh ID
    #[inline]
    #[must_use]
    pub fn new(sub_goal_id: SubGoalId, kind: ActionKind) -> Self {
        Self {
            id: ActionId::generate(),
            sub_goal_id,
            kind,
            progress: 0,
            achieved_at: None,
            version: 0,
            tasks: Vec::new(),
        }
    }

    /// Number of tasks that count as complete
    #[inline]
    #[must_use]
    pub fn completed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_complete()).count()
    }

    /// Entity reference for this action
    #[inline]
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::action(&self.id)
    }
}

/// Second-level node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubGoal {
    /// SubGoal ID
    pub id: SubGoalId,
    /// Owning goal
    pub goal_id: GoalId,
    /// Persisted progress
    pub progress: i32,
    /// Optimistic concurrency token
    pub version: u64,
    /// Owned actions
    pub actions: Vec<Action>,
}

impl SubGoal {
    /// Create empty subgoal with a fresh ID
    #[inline]
    #[must_use]
    pub fn new(goal_id: GoalId) -> Self {
        Self {
            id: SubGoalId::generate(),
            goal_id,
            progress: 0,
            version: 0,
            actions: Vec::new(),
        }
    }

    /// Find an owned action
    #[must_use]
    pub fn find_action(&self, id: &ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Entity reference for this subgoal
    #[inline]
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::sub_goal(&self.id)
    }
}

/// Top-level node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Goal ID
    pub id: GoalId,
    /// Persisted progress
    pub progress: i32,
    /// Set when progress reaches 100
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token
    pub version: u64,
    /// Owned subgoals
    pub sub_goals: Vec<SubGoal>,
}

impl Goal {
    /// Create empty goal with a fresh ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(GoalId::generate())
    }

    /// Create empty goal with a given ID
    #[inline]
    #[must_use]
    pub fn with_id(id: GoalId) -> Self {
        Self {
            id,
            progress: 0,
            completed_at: None,
            version: 0,
            sub_goals: Vec::new(),
        }
    }

    /// Find an owned subgoal
    #[must_use]
    pub fn find_sub_goal(&self, id: &SubGoalId) -> Option<&SubGoal> {
        self.sub_goals.iter().find(|s| &s.id == id)
    }

    /// Iterate every action in the subtree
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.sub_goals.iter().flat_map(|s| s.actions.iter())
    }

    /// Entity reference for this goal
    #[inline]
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::goal(&self.id)
    }
}

impl Default for Goal {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only progress snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressHistoryEntry {
    /// Entity the snapshot belongs to
    pub entity_id: String,
    /// Level of that entity
    pub entity_type: EntityType,
    /// Progress at `timestamp`
    pub progress: u8,
    /// When the value was recorded
    pub timestamp: DateTime<Utc>,
    /// Free-form reason for the change
    pub change_reason: Option<String>,
}

impl ProgressHistoryEntry {
    /// Create entry for an entity
    #[inline]
    #[must_use]
    pub fn new(entity: &EntityRef, progress: u8, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity.id.clone(),
            entity_type: entity.entity_type,
            progress,
            timestamp,
            change_reason: None,
        }
    }

    /// With change reason
    #[inline]
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.change_reason = Some(reason.into());
        self
    }

    /// Entity reference for this entry
    #[inline]
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.clone())
    }
}
