//! Progress cache using moka
//!
//! Maps `(entity type, entity id)` to the last computed progress value.
//! The cache is a derived index: every entry can be rebuilt from persisted
//! data, so eviction or a full clear only costs performance.
//!
//! - Bounded capacity with least-recently-used eviction
//! - Sharded internally; unrelated keys never wait on one another
//! - Hit/miss accounting since the last [`ProgressCache::clear`]
//! - No time-based expiry
//!
//! Each entry carries the store version it was computed from. A put never
//! replaces an entry computed from a newer version, so a writer that commits
//! first but reaches the cache last cannot bring back a superseded value.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use summit_model::EntityRef;

/// Default number of live entries
pub const DEFAULT_CAPACITY: u64 = 1_000;

/// Cached progress value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProgress {
    /// Progress in `[0, 100]`
    pub progress: u8,
    /// Store version of the row the value was computed from
    pub version: u64,
    /// When the value was computed
    pub computed_at: DateTime<Utc>,
}

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of live entries
    pub size: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup
    pub hit_rate: f64,
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Concurrent progress cache
///
/// Cloning is cheap and clones share entries and counters.
#[derive(Debug, Clone)]
pub struct ProgressCache {
    inner: Cache<EntityRef, CachedProgress>,
    counters: Arc<Counters>,
    capacity: u64,
}

impl ProgressCache {
    /// Create cache with max capacity
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            counters: Arc::new(Counters::default()),
            capacity: max_capacity,
        }
    }

    /// Configured capacity
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Look up a value, recording a hit or a miss
    pub async fn get(&self, entity: &EntityRef) -> Option<CachedProgress> {
        let found = self.inner.get(entity).await;
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = %entity, "progress cache hit");
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = %entity, "progress cache miss");
        }
        found
    }

    /// Insert a value unless the cached one comes from a newer version
    ///
    /// Equal versions overwrite. Returns whether the value was stored.
    pub async fn put(
        &self,
        entity: EntityRef,
        progress: u8,
        version: u64,
        computed_at: DateTime<Utc>,
    ) -> bool {
        let value = CachedProgress {
            progress,
            version,
            computed_at,
        };
        let result = self
            .inner
            .entry(entity)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().version > version => Op::Nop,
                    _ => Op::Put(value),
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(_) | CompResult::ReplacedWith(_) => true,
            CompResult::Unchanged(entry) => {
                tracing::debug!(
                    entity = %entry.key(),
                    version,
                    cached_version = entry.value().version,
                    "kept newer progress cache entry"
                );
                false
            }
            _ => false,
        }
    }

    /// Drop a single entry
    #[inline]
    pub async fn invalidate(&self, entity: &EntityRef) {
        self.inner.invalidate(entity).await;
    }

    /// Drop several entries
    pub async fn invalidate_many<'a, I>(&self, entities: I)
    where
        I: IntoIterator<Item = &'a EntityRef>,
    {
        for entity in entities {
            self.inner.invalidate(entity).await;
        }
    }

    /// Empty the cache and reset hit/miss counters
    pub async fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
    }

    /// Get cache statistics
    ///
    /// Flushes pending maintenance first so `size` reflects evictions.
    pub async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size: self.inner.entry_count(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            hits,
            misses,
        }
    }
}

impl Default for ProgressCache {
    /// Create cache with default capacity (1,000 entries)
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summit_model::EntityType;

    fn goal(id: &str) -> EntityRef {
        EntityRef::new(EntityType::Goal, id)
    }

    #[tokio::test]
    async fn cache_put_and_get() {
        let cache = ProgressCache::new(100);
        let now = Utc::now();
        cache.put(goal("g1"), 42, 0, now).await;

        let cached = cache.get(&goal("g1")).await.unwrap();
        assert_eq!(cached.progress, 42);
        assert_eq!(cached.computed_at, now);
    }

    #[tokio::test]
    async fn older_version_never_replaces_newer() {
        let cache = ProgressCache::new(100);
        let now = Utc::now();

        assert!(cache.put(goal("g1"), 50, 2, now).await);
        assert!(!cache.put(goal("g1"), 25, 1, now).await);
        assert_eq!(cache.get(&goal("g1")).await.unwrap().progress, 50);

        assert!(cache.put(goal("g1"), 60, 2, now).await);
        assert!(cache.put(goal("g1"), 75, 3, now).await);
        let cached = cache.get(&goal("g1")).await.unwrap();
        assert_eq!((cached.progress, cached.version), (75, 3));
    }

    #[tokio::test]
    async fn racing_puts_keep_the_highest_version() {
        let cache = ProgressCache::new(100);
        let mut handles = Vec::new();
        for version in (0..32u64).rev() {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let progress = u8::try_from(version).unwrap();
                cache.put(goal("g1"), progress, version, Utc::now()).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cached = cache.get(&goal("g1")).await.unwrap();
        assert_eq!(cached.version, 31);
        assert_eq!(cached.progress, 31);
    }

    #[tokio::test]
    async fn keys_are_scoped_by_entity_type() {
        let cache = ProgressCache::new(100);
        cache.put(goal("x"), 10, 0, Utc::now()).await;

        let as_action = EntityRef::new(EntityType::Action, "x");
        assert!(cache.get(&as_action).await.is_none());
    }

    #[tokio::test]
    async fn stats_track_hit_rate() {
        let cache = ProgressCache::new(100);
        cache.put(goal("g1"), 1, 0, Utc::now()).await;

        cache.get(&goal("g1")).await;
        cache.get(&goal("g1")).await;
        cache.get(&goal("g1")).await;
        cache.get(&goal("missing")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn clear_resets_entries_and_counters() {
        let cache = ProgressCache::new(100);
        cache.put(goal("g1"), 1, 0, Utc::now()).await;
        cache.get(&goal("g1")).await;

        cache.clear().await;

        let stats = cache.stats().await;
        assert_eq!(stats, CacheStats::default());
        assert!(cache.get(&goal("g1")).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_drops_entries() {
        let cache = ProgressCache::new(100);
        let keys: Vec<_> = (0..3).map(|i| goal(&format!("g{i}"))).collect();
        for key in &keys {
            cache.put(key.clone(), 5, 0, Utc::now()).await;
        }

        cache.invalidate(&keys[0]).await;
        assert!(cache.get(&keys[0]).await.is_none());

        cache.invalidate_many(&keys[1..]).await;
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn size_stays_within_capacity() {
        let cache = ProgressCache::new(10);
        for i in 0..50 {
            cache.put(goal(&format!("g{i}")), 1, 0, Utc::now()).await;
        }

        let stats = cache.stats().await;
        assert!(stats.size <= 10, "size {} exceeds capacity", stats.size);
        assert!(cache.get(&goal("g49")).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_access_keeps_counts_consistent() {
        let cache = ProgressCache::new(1_000);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = goal(&format!("w{worker}-{i}"));
                    cache.put(key.clone(), 7, 0, Utc::now()).await;
                    assert!(cache.get(&key).await.is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 400);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 400);
    }

    #[test]
    fn default_capacity() {
        assert_eq!(ProgressCache::default().capacity(), DEFAULT_CAPACITY);
    }
}
