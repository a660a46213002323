//! Integrity validation, repair and batch reconciliation
//!
//! All three operations bypass the cache and persisted progress: every level
//! is recomputed from raw task statuses and compared with what is stored.

use crate::engine::{marker_update, stage_progress, ProgressEngine};
use crate::error::ProgressError;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use summit_model::{
    action_progress, goal_progress, is_valid_progress, sub_goal_progress, EntityRef, EntityType,
    Goal, GoalId,
};
use summit_store::WriteBatch;

const REPAIR_REASON: &str = "integrity repair";
const BATCH_REASON: &str = "batch reconciliation";

/// Why a stored value was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Stored value outside `[0, 100]`
    OutOfRange,
    /// Stored value in range but not what the tasks imply
    Mismatch,
}

/// One level whose stored progress disagrees with recomputed truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    /// Offending entity
    pub entity: EntityRef,
    /// Persisted value
    pub stored: i32,
    /// Recomputed value
    pub expected: u8,
    /// Classification
    pub kind: DiscrepancyKind,
}

/// Result of [`ProgressEngine::validate_data_integrity`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Audited goal
    pub goal_id: GoalId,
    /// True when no discrepancy was found
    pub is_valid: bool,
    /// Ordered goal, then subgoals, then actions
    pub discrepancies: Vec<Discrepancy>,
}

impl IntegrityReport {
    /// Turn an invalid report into an error
    ///
    /// # Errors
    /// `ProgressError::IntegrityViolation` carrying the discrepancies
    pub fn into_result(self) -> Result<Self, ProgressError> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(ProgressError::IntegrityViolation {
                goal_id: self.goal_id,
                discrepancies: self.discrepancies,
            })
        }
    }
}

/// Result of [`ProgressEngine::repair_data_integrity`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Repaired goal
    pub goal_id: GoalId,
    /// False when there was nothing to fix
    pub repaired: bool,
    /// Distinct levels touched, goal first
    pub levels_fixed: Vec<EntityType>,
    /// Every entity rewritten
    pub entities_fixed: Vec<EntityRef>,
}

/// Result of [`ProgressEngine::batch_update_progress`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Goals recomputed and persisted, in request order
    pub updated: Vec<GoalId>,
    /// Requested goals that do not exist
    pub missing: Vec<GoalId>,
}

/// Stored versus recomputed state of one node
#[derive(Debug)]
struct NodeState {
    entity: EntityRef,
    stored: i32,
    version: u64,
    expected: u8,
    // Only goals and actions carry a marker.
    marker: Option<Option<DateTime<Utc>>>,
}

impl NodeState {
    fn discrepancy(&self) -> Option<Discrepancy> {
        let kind = if !is_valid_progress(self.stored) {
            DiscrepancyKind::OutOfRange
        } else if self.stored != i32::from(self.expected) {
            DiscrepancyKind::Mismatch
        } else {
            return None;
        };
        Some(Discrepancy {
            entity: self.entity.clone(),
            stored: self.stored,
            expected: self.expected,
            kind,
        })
    }

    fn stage(&self, batch: &mut WriteBatch, now: DateTime<Utc>, reason: &str) {
        stage_progress(
            batch,
            self.entity.clone(),
            self.stored,
            self.version,
            self.expected,
            now,
            reason,
        );
        if let Some(current) = self.marker {
            if let Some(at) = marker_update(current, self.expected, now) {
                batch.set_marker(self.entity.clone(), at);
            }
        }
    }
}

fn node_states(goal: &Goal) -> Vec<NodeState> {
    let mut nodes = vec![NodeState {
        entity: goal.entity_ref(),
        stored: goal.progress,
        version: goal.version,
        expected: goal_progress(goal),
        marker: Some(goal.completed_at),
    }];
    nodes.extend(goal.sub_goals.iter().map(|sub| NodeState {
        entity: sub.entity_ref(),
        stored: sub.progress,
        version: sub.version,
        expected: sub_goal_progress(sub),
        marker: None,
    }));
    nodes.extend(goal.actions().map(|action| NodeState {
        entity: action.entity_ref(),
        stored: action.progress,
        version: action.version,
        expected: action_progress(action),
        marker: Some(action.achieved_at),
    }));
    nodes
}

impl ProgressEngine {
    /// Compare every stored level of a goal against recomputed values
    ///
    /// # Errors
    /// `NotFound` for an unknown goal, `Storage` on load failure
    pub async fn validate_data_integrity(
        &self,
        goal_id: &GoalId,
    ) -> Result<IntegrityReport, ProgressError> {
        let goal = self.require_goal(goal_id).await?;
        let discrepancies: Vec<Discrepancy> = node_states(&goal)
            .iter()
            .filter_map(NodeState::discrepancy)
            .collect();

        if discrepancies.is_empty() {
            tracing::debug!(goal_id = %goal_id, "integrity check passed");
        } else {
            tracing::warn!(
                goal_id = %goal_id,
                discrepancies = discrepancies.len(),
                "integrity check found drift"
            );
        }

        Ok(IntegrityReport {
            goal_id: goal.id,
            is_valid: discrepancies.is_empty(),
            discrepancies,
        })
    }

    /// Rewrite every discrepant level of a goal in one atomic batch
    ///
    /// # Errors
    /// `NotFound` for an unknown goal, `Storage` if the commit fails
    pub async fn repair_data_integrity(
        &self,
        goal_id: &GoalId,
    ) -> Result<RepairReport, ProgressError> {
        let goal = self.require_goal(goal_id).await?;
        let broken: Vec<NodeState> = node_states(&goal)
            .into_iter()
            .filter(|node| node.discrepancy().is_some())
            .collect();

        if broken.is_empty() {
            return Ok(RepairReport {
                goal_id: goal.id,
                repaired: false,
                levels_fixed: Vec::new(),
                entities_fixed: Vec::new(),
            });
        }

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        for node in &broken {
            node.stage(&mut batch, now, REPAIR_REASON);
        }
        self.store.commit(batch).await?;

        let entities_fixed: Vec<EntityRef> = broken.into_iter().map(|n| n.entity).collect();
        self.cache.invalidate_many(&entities_fixed).await;

        let mut levels_fixed: Vec<EntityType> = Vec::new();
        for entity in &entities_fixed {
            if !levels_fixed.contains(&entity.entity_type) {
                levels_fixed.push(entity.entity_type);
            }
        }

        tracing::info!(
            goal_id = %goal_id,
            entities = entities_fixed.len(),
            "integrity repaired"
        );

        Ok(RepairReport {
            goal_id: goal.id,
            repaired: true,
            levels_fixed,
            entities_fixed,
        })
    }

    /// Recompute and persist the full hierarchy of each listed goal
    ///
    /// Goals are reconciled concurrently, each in its own atomic batch.
    ///
    /// # Errors
    /// The first storage failure; goals already committed stay committed
    pub async fn batch_update_progress(
        &self,
        goal_ids: &[GoalId],
    ) -> Result<BatchReport, ProgressError> {
        let outcomes: Vec<(GoalId, bool)> = stream::iter(goal_ids)
            .map(|id| async move {
                let found = self.reconcile_goal(id).await?;
                Ok::<_, ProgressError>((id.clone(), found))
            })
            .buffered(self.config.batch_concurrency)
            .try_collect()
            .await?;

        let mut report = BatchReport::default();
        for (id, found) in outcomes {
            if found {
                report.updated.push(id);
            } else {
                report.missing.push(id);
            }
        }

        tracing::info!(
            updated = report.updated.len(),
            missing = report.missing.len(),
            "batch reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_goal(&self, goal_id: &GoalId) -> Result<bool, ProgressError> {
        let Some(goal) = self.store.load_goal(goal_id).await? else {
            tracing::warn!(goal_id = %goal_id, "batch reconciliation skipped unknown goal");
            return Ok(false);
        };

        let nodes = node_states(&goal);
        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        for node in &nodes {
            node.stage(&mut batch, now, BATCH_REASON);
        }
        self.store.commit(batch).await?;

        // Every node was written once, bumping its version.
        for node in nodes {
            self.cache
                .put(node.entity, node.expected, node.version + 1, now)
                .await;
        }
        Ok(true)
    }
}
