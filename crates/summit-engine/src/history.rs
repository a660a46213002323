//! Progress history
//!
//! Append-only log of progress snapshots with read-only analytics:
//! - Range queries
//! - Trend direction via least-squares regression over entry index
//! - Significant-change detection between consecutive entries
//! - Retention cleanup, triggered opportunistically from the write path

use crate::config::EngineConfig;
use crate::error::ProgressError;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use summit_model::{Clock, EntityRef, ProgressHistoryEntry};
use summit_store::{HistoryQuery, ProgressStore, WriteBatch};

/// Direction of a progress trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    /// Slope above the stable band
    Increasing,
    /// Slope below the stable band
    Decreasing,
    /// Too little data, or slope within the stable band
    Stable,
}

/// Result of trend analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressTrend {
    /// Direction of travel
    pub direction: TrendDirection,
    /// Absolute slope, in progress points per entry
    pub rate: f64,
    /// `min(entries / 10, 1)`
    pub confidence: f64,
}

impl ProgressTrend {
    /// Trend reported when there is not enough data
    #[must_use]
    pub fn stable() -> Self {
        Self {
            direction: TrendDirection::Stable,
            rate: 0.0,
            confidence: 0.0,
        }
    }
}

/// Consecutive-entry jump at or above a threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignificantChange {
    /// Timestamp of the later entry
    pub date: DateTime<Utc>,
    /// Progress of the later entry
    pub progress: u8,
    /// Signed delta from the earlier entry
    pub change: i32,
    /// Change reason of the later entry
    pub reason: Option<String>,
}

/// Least-squares trend over values ordered by entry index
#[must_use]
pub fn compute_trend(values: &[u8], stable_slope: f64) -> ProgressTrend {
    if values.len() < 2 {
        return ProgressTrend::stable();
    }

    let n = values.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, value) in values.iter().enumerate() {
        let x = i as f64;
        let y = f64::from(*value);
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    // Non-zero for n >= 2 since the x values are distinct.
    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);

    let direction = if slope.abs() < stable_slope {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    ProgressTrend {
        direction,
        rate: slope.abs(),
        confidence: (n / 10.0).min(1.0),
    }
}

/// Consecutive pairs whose progress moved by at least `threshold`
#[must_use]
pub fn find_significant_changes(
    entries: &[ProgressHistoryEntry],
    threshold: u8,
) -> Vec<SignificantChange> {
    entries
        .windows(2)
        .filter_map(|pair| {
            let change = i32::from(pair[1].progress) - i32::from(pair[0].progress);
            (change.abs() >= i32::from(threshold)).then(|| SignificantChange {
                date: pair[1].timestamp,
                progress: pair[1].progress,
                change,
                reason: pair[1].change_reason.clone(),
            })
        })
        .collect()
}

/// History store over a [`ProgressStore`]
#[derive(Debug)]
pub struct ProgressHistory {
    store: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    cleanup_interval: Duration,
    stable_slope: f64,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl ProgressHistory {
    /// Create history store
    #[must_use]
    pub fn new(store: Arc<dyn ProgressStore>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
            stable_slope: config.trend_stable_slope,
            last_cleanup: Mutex::new(None),
        }
    }

    /// Append one entry
    ///
    /// No deduplication happens here; only call this for changed values.
    ///
    /// # Errors
    /// Storage failure
    pub async fn record_progress_history(
        &self,
        entry: ProgressHistoryEntry,
    ) -> Result<(), ProgressError> {
        let mut batch = WriteBatch::new();
        batch.append_history(entry);
        self.store.commit(batch).await?;
        Ok(())
    }

    /// Entries in the query window, ascending by timestamp
    ///
    /// # Errors
    /// Storage failure
    pub async fn progress_history_entries(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ProgressHistoryEntry>, ProgressError> {
        Ok(self.store.history_entries(query).await?)
    }

    /// Trend over the last `days`
    ///
    /// # Errors
    /// Storage failure
    pub async fn progress_trend(
        &self,
        entity: &EntityRef,
        days: u32,
    ) -> Result<ProgressTrend, ProgressError> {
        let since = self.clock.now() - Duration::days(i64::from(days));
        let entries = self
            .store
            .history_entries(&HistoryQuery::for_entity(entity).since(since))
            .await?;
        let values: Vec<u8> = entries.iter().map(|e| e.progress).collect();
        Ok(compute_trend(&values, self.stable_slope))
    }

    /// Significant jumps across the retained history
    ///
    /// # Errors
    /// Storage failure
    pub async fn significant_changes(
        &self,
        entity: &EntityRef,
        threshold: u8,
    ) -> Result<Vec<SignificantChange>, ProgressError> {
        let since = self.clock.now() - self.retention;
        let entries = self
            .store
            .history_entries(&HistoryQuery::for_entity(entity).since(since))
            .await?;
        Ok(find_significant_changes(&entries, threshold))
    }

    /// Delete entries older than the retention window
    ///
    /// # Returns
    /// Number of entries removed
    ///
    /// # Errors
    /// Storage failure
    pub async fn cleanup_old_history(&self) -> Result<u64, ProgressError> {
        let cutoff = self.clock.now() - self.retention;
        let removed = self.store.purge_history_before(cutoff).await?;
        tracing::info!(removed, cutoff = %cutoff, "purged old progress history");
        Ok(removed)
    }

    /// Run cleanup if the interval has elapsed since the last attempt
    ///
    /// Never fails: a cleanup error is logged and the next attempt waits for
    /// the following interval.
    pub async fn maybe_cleanup(&self) -> Option<u64> {
        let now = self.clock.now();
        {
            let mut last = self.last_cleanup.lock();
            if matches!(*last, Some(prev) if now - prev < self.cleanup_interval) {
                return None;
            }
            *last = Some(now);
        }

        match self.cleanup_old_history().await {
            Ok(removed) => Some(removed),
            Err(err) => {
                tracing::warn!(error = %err, "progress history cleanup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summit_model::{EntityType, ManualClock};
    use summit_store::{FailPoint, MemoryStore};

    fn entry(progress: u8, at: DateTime<Utc>) -> ProgressHistoryEntry {
        ProgressHistoryEntry::new(&EntityRef::new(EntityType::Goal, "g"), progress, at)
    }

    #[test]
    fn trend_needs_two_points() {
        assert_eq!(compute_trend(&[], 0.1), ProgressTrend::stable());
        assert_eq!(compute_trend(&[40], 0.1), ProgressTrend::stable());
    }

    #[test]
    fn trend_direction_and_rate() {
        let up = compute_trend(&[10, 20, 30, 40], 0.1);
        assert_eq!(up.direction, TrendDirection::Increasing);
        assert!((up.rate - 10.0).abs() < 1e-9);
        assert!((up.confidence - 0.4).abs() < 1e-9);

        let down = compute_trend(&[90, 60, 30], 0.1);
        assert_eq!(down.direction, TrendDirection::Decreasing);
        assert!((down.rate - 30.0).abs() < 1e-9);

        let flat = compute_trend(&[50, 50, 50, 50, 50, 50, 50, 50, 50, 50, 50, 50], 0.1);
        assert_eq!(flat.direction, TrendDirection::Stable);
        assert!((flat.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn significant_changes_respect_threshold() {
        let now = Utc::now();
        let entries = vec![
            entry(0, now),
            entry(9, now + Duration::minutes(1)),
            entry(19, now + Duration::minutes(2)).with_reason("jump"),
            entry(5, now + Duration::minutes(3)),
        ];
        let changes = find_significant_changes(&entries, 10);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change, 10);
        assert_eq!(changes[0].reason.as_deref(), Some("jump"));
        assert_eq!(changes[1].change, -14);
        assert!(changes.iter().all(|c| c.change.abs() >= 10));
    }

    #[tokio::test]
    async fn maybe_cleanup_runs_once_per_interval() {
        let start = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start));
        let history = ProgressHistory::new(store.clone(), clock.clone(), &EngineConfig::new());

        history
            .record_progress_history(entry(10, start - Duration::days(31)))
            .await
            .unwrap();
        assert_eq!(history.maybe_cleanup().await, Some(1));

        history
            .record_progress_history(entry(20, start - Duration::days(40)))
            .await
            .unwrap();
        assert_eq!(history.maybe_cleanup().await, None);
        assert_eq!(store.history_len(), 1);

        clock.advance(Duration::hours(24));
        assert_eq!(history.maybe_cleanup().await, Some(1));
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn maybe_cleanup_swallows_failures() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(FailPoint::Purge);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let history = ProgressHistory::new(store.clone(), clock, &EngineConfig::new());

        assert_eq!(history.maybe_cleanup().await, None);
        assert!(history.cleanup_old_history().await.is_err());
    }
}
