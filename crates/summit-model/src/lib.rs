//! Summit Model
//!
//! The goal hierarchy and the pure progress formulas over it.
//!
//! ```text
//! Goal ─┬─ SubGoal ─┬─ Action (Execution | Habit) ─┬─ Task
//!       │           │                              └─ Task
//!       │           └─ Action ...
//!       └─ SubGoal ...
//! ```
//!
//! Progress flows bottom-up: task completion → action → subgoal → goal.
//!
//! # Example
//!
//! ```rust,ignore
//! use summit_model::prelude::*;
//!
//! let mut goal = Goal::new();
//! let sub = SubGoal::new(goal.id.clone());
//! goal.sub_goals.push(sub);
//! assert_eq!(goal_progress(&goal), 0);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod calculator;
pub mod clock;
pub mod types;

// Re-exports for convenience
pub use calculator::{
    action_progress, execution_progress, goal_progress, habit_progress, rounded_mean,
    sub_goal_progress, HABIT_TARGET_RATIO,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{
    is_valid_progress, Action, ActionId, ActionKind, EntityRef, EntityType, Goal, GoalId,
    ParseError, ProgressHistoryEntry, SubGoal, SubGoalId, Task, TaskId, TaskStatus, MAX_PROGRESS,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the hierarchy
    pub use crate::calculator::{action_progress, goal_progress, sub_goal_progress};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::types::{
        Action, ActionId, ActionKind, EntityRef, EntityType, Goal, GoalId, SubGoal, SubGoalId,
        Task, TaskId, TaskStatus,
    };
}
