//! Progress calculator
//!
//! Pure aggregation formulas for every level of the hierarchy. Nothing here
//! performs I/O; callers pass already-loaded nodes.
//!
//! # Formulas
//!
//! - Execution action: `round(100 * completed / total)`
//! - Habit action: `min(100, round((100 * completed / total) / 0.8))`
//! - SubGoal: rounded mean of its actions
//! - Goal: rounded mean of its subgoals
//!
//! All rounding is round-half-up, computed in integer arithmetic as
//! `(2 * num + den) / (2 * den)`.

use crate::types::{Action, ActionKind, Goal, SubGoal, MAX_PROGRESS};

/// Raw completion ratio at which a habit counts as fully established
pub const HABIT_TARGET_RATIO: f64 = 0.8;

// 100 / 0.8, kept integral so habit rounding stays exact.
const HABIT_SCALE: u64 = 125;

/// Round `num / den` half-up; `den` must be non-zero
#[inline]
fn round_div(num: u64, den: u64) -> u64 {
    (2 * num + den) / (2 * den)
}

#[inline]
fn clamp_progress(value: u64) -> u8 {
    // Bounded by MAX_PROGRESS, so the narrowing is lossless.
    u8::try_from(value.min(u64::from(MAX_PROGRESS))).unwrap_or(MAX_PROGRESS)
}

/// Progress of an execution action with `completed` of `total` tasks done
#[must_use]
pub fn execution_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    clamp_progress(round_div(100 * completed as u64, total as u64))
}

/// Progress of a habit action with `completed` of `total` tasks done
///
/// 80% raw completion maps to 100 and anything above is capped there.
#[must_use]
pub fn habit_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    clamp_progress(round_div(HABIT_SCALE * completed as u64, total as u64))
}

/// Rounded arithmetic mean; 0 for an empty input
#[must_use]
pub fn rounded_mean<I>(values: I) -> u8
where
    I: IntoIterator<Item = u8>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0u64, 0u64), |(sum, count), v| (sum + u64::from(v), count + 1));
    if count == 0 {
        return 0;
    }
    clamp_progress(round_div(sum, count))
}

/// Progress of an action from its tasks
#[must_use]
pub fn action_progress(action: &Action) -> u8 {
    let total = action.tasks.len();
    let completed = action.completed_tasks();
    match action.kind {
        ActionKind::Execution => execution_progress(completed, total),
        ActionKind::Habit => habit_progress(completed, total),
    }
}

/// Progress of a subgoal: rounded mean over its actions
#[must_use]
pub fn sub_goal_progress(sub_goal: &SubGoal) -> u8 {
    rounded_mean(sub_goal.actions.iter().map(action_progress))
}

/// Progress of a goal: rounded mean over its subgoals
#[must_use]
pub fn goal_progress(goal: &Goal) -> u8 {
    rounded_mean(goal.sub_goals.iter().map(sub_goal_progress))
}
