//! Engine configuration

use crate::error::ProgressError;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Progress engine configuration
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// cache_capacity = 5000
/// history_retention_days = 60
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum live cache entries
    pub cache_capacity: u64,
    /// History entries older than this many days are purged
    pub history_retention_days: i64,
    /// Minimum hours between opportunistic history cleanups
    pub cleanup_interval_hours: i64,
    /// Default delta for significant-change detection
    pub significant_change_threshold: u8,
    /// Regression slopes below this magnitude count as stable
    pub trend_stable_slope: f64,
    /// Goals reconciled concurrently by batch updates
    pub batch_concurrency: usize,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With cache capacity
    #[inline]
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// With history retention window
    #[inline]
    #[must_use]
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.history_retention_days = days;
        self
    }

    /// With cleanup interval
    #[inline]
    #[must_use]
    pub fn with_cleanup_interval_hours(mut self, hours: i64) -> Self {
        self.cleanup_interval_hours = hours;
        self
    }

    /// With significant-change threshold
    #[inline]
    #[must_use]
    pub fn with_significant_change_threshold(mut self, threshold: u8) -> Self {
        self.significant_change_threshold = threshold;
        self
    }

    /// With batch concurrency
    #[inline]
    #[must_use]
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    /// Parse from TOML and validate
    ///
    /// # Errors
    /// `ProgressError::Config` on malformed TOML or invalid values
    pub fn from_toml_str(source: &str) -> Result<Self, ProgressError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ProgressError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values are usable
    ///
    /// # Errors
    /// `ProgressError::Config` naming the first invalid field
    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.cache_capacity == 0 {
            return Err(ProgressError::Config("cache_capacity must be > 0".into()));
        }
        if self.history_retention_days <= 0 {
            return Err(ProgressError::Config(
                "history_retention_days must be > 0".into(),
            ));
        }
        if self.cleanup_interval_hours < 0 {
            return Err(ProgressError::Config(
                "cleanup_interval_hours must be >= 0".into(),
            ));
        }
        if self.batch_concurrency == 0 {
            return Err(ProgressError::Config("batch_concurrency must be > 0".into()));
        }
        if !(self.trend_stable_slope.is_finite() && self.trend_stable_slope >= 0.0) {
            return Err(ProgressError::Config(
                "trend_stable_slope must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Retention window as a duration
    #[inline]
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::days(self.history_retention_days)
    }

    /// Cleanup interval as a duration
    #[inline]
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::hours(self.cleanup_interval_hours)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: summit_cache::DEFAULT_CAPACITY,
            history_retention_days: 30,
            cleanup_interval_hours: 24,
            significant_change_threshold: 10,
            trend_stable_slope: 0.1,
            batch_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.cache_capacity, 1_000);
        assert_eq!(config.retention(), Duration::days(30));
        assert_eq!(config.cleanup_interval(), Duration::hours(24));
        assert_eq!(config.significant_change_threshold, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            cache_capacity = 50
            history_retention_days = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_capacity, 50);
        assert_eq!(config.history_retention_days, 7);
        assert_eq!(config.batch_concurrency, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EngineConfig::from_toml_str("cache_capacity = 0").is_err());
        assert!(EngineConfig::from_toml_str("batch_concurrency = 0").is_err());
        assert!(EngineConfig::from_toml_str("cache_capacity = \"lots\"").is_err());
        assert!(EngineConfig::new()
            .with_retention_days(0)
            .validate()
            .is_err());
    }

    #[test]
    fn builder_methods() {
        let config = EngineConfig::new()
            .with_cache_capacity(10)
            .with_cleanup_interval_hours(1)
            .with_significant_change_threshold(5)
            .with_batch_concurrency(2);
        assert_eq!(config.cache_capacity, 10);
        assert_eq!(config.cleanup_interval_hours, 1);
        assert_eq!(config.significant_change_threshold, 5);
        assert_eq!(config.batch_concurrency, 2);
    }
}
