//! Tag-aware cache facade.
//!
//! [`TaggedCache`] composes a [`CacheStore`] and a [`TagIndex`]. Writes go to
//! the store first and are then filed under their tags; invalidating a tag
//! removes every entry filed under it. A tag reference whose entry is gone
//! reads as "not cached", so the index never needs to be exact for reads to
//! be correct.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tagcache_core::{CacheConfig, CacheEntry, CacheError, CacheResult};
use tokio::task::JoinHandle;

use super::gc::{GarbageCollector, GcReport};
use super::traits::{CacheStats, CacheStore, TagIndex};

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidated: AtomicU64,
}

/// Cache with bulk invalidation by tag.
///
/// # Example
///
/// ```ignore
/// let cache = TaggedCache::new(Arc::new(MemoryStore::new()), Arc::new(MemoryTagIndex::new()), CacheConfig::default());
///
/// cache.set_with_tags("select:ab12", rows, None, ["Post", "User"]).await?;
/// assert!(cache.get("select:ab12").await?.is_some());
///
/// // A write to posts makes every cached post query a miss.
/// cache.delete_tag("Post").await?;
/// assert!(cache.get("select:ab12").await?.is_none());
/// ```
pub struct TaggedCache<S, I>
where
    S: CacheStore,
    I: TagIndex,
{
    store: Arc<S>,
    index: Arc<I>,
    gc: GarbageCollector<S, I>,
    config: Arc<CacheConfig>,
    stats: Arc<StatsCounters>,
}

impl<S, I> TaggedCache<S, I>
where
    S: CacheStore + 'static,
    I: TagIndex + 'static,
{
    /// Create a cache over a store and tag index.
    pub fn new(store: Arc<S>, index: Arc<I>, config: CacheConfig) -> Self {
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::clone(&index));
        Self {
            store,
            index,
            gc,
            config: Arc::new(config),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Get a live value.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self.store.get(key).await? {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache hit");
                Ok(Some(entry.value))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Store a value without tags.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.set_with_tags(key, value, ttl, std::iter::empty::<String>())
            .await
    }

    /// Store a value and file it under `tags`.
    ///
    /// `ttl = None` applies the configured default TTL, which may itself be
    /// `None` for entries that only leave through invalidation.
    pub async fn set_with_tags<T>(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = T>,
    ) -> CacheResult<()>
    where
        T: Into<String>,
    {
        let ttl = ttl.or_else(|| self.config.default_ttl());
        let entry = CacheEntry::new(key, value, ttl).with_tags(tags);

        self.store.put(&entry).await?;
        self.index.attach_all(&entry.tags, key).await?;

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            key = %key,
            tags = entry.tags.len(),
            ttl_secs = ttl.map(|t| t.as_secs()),
            "Cache write"
        );
        Ok(())
    }

    /// Remove every entry filed under `tag`.
    ///
    /// Keys already gone from the store are tolerated. Every key is attempted
    /// even if some removals fail; the first failure is then returned.
    ///
    /// Returns the number of entries actually removed.
    pub async fn delete_tag(&self, tag: &str) -> CacheResult<u64> {
        let keys = self.index.detach_all(tag).await?;

        let mut removed = 0u64;
        let mut first_error: Option<CacheError> = None;
        for key in &keys {
            match self.store.remove(key).await {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tag = %tag, key = %key, error = %e, "Failed to remove tagged entry");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.stats.invalidated.fetch_add(removed, Ordering::Relaxed);
        tracing::debug!(tag = %tag, keys = keys.len(), removed = removed, "Tag invalidated");

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Remove one entry. Its tag memberships are left for the sweeper.
    pub async fn delete_key(&self, key: &str) -> CacheResult<bool> {
        Ok(self.store.remove(key).await?.is_some())
    }

    /// Live entries reachable through `tag`, sorted by key.
    pub async fn find(&self, tag: &str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        let keys: BTreeSet<String> = self.index.keys_for(tag).await?;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.store.get(&key).await? {
                found.push((key, entry.value));
            }
        }
        Ok(found)
    }

    /// Drop every entry and every tag. Returns the number of entries removed.
    pub async fn delete_all(&self) -> CacheResult<u64> {
        let removed = self.store.clear().await?;
        self.index.clear().await?;
        tracing::info!(removed = removed, "Cache cleared");
        Ok(removed)
    }

    /// Sweep with the given probability. Returns whether a sweep ran.
    pub async fn maybe_collect(&self, probability: f64) -> CacheResult<bool> {
        self.gc.maybe_collect(probability).await
    }

    /// Decide inline and sweep on a background task.
    pub fn spawn_maybe_collect(
        &self,
        probability: f64,
    ) -> Option<JoinHandle<CacheResult<GcReport>>> {
        self.gc.spawn_maybe_collect(probability)
    }

    /// Sweep with the configured probability, inline or in the background as
    /// configured.
    pub async fn maybe_collect_configured(&self) -> CacheResult<bool> {
        let probability = self.config.gc_probability();
        if self.config.gc_in_background {
            Ok(self.spawn_maybe_collect(probability).is_some())
        } else {
            self.maybe_collect(probability).await
        }
    }

    /// Run one full sweep.
    pub async fn collect(&self) -> CacheResult<GcReport> {
        self.gc.collect().await
    }

    /// Usage counters since construction, shared by clones.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            invalidated: self.stats.invalidated.load(Ordering::Relaxed),
        }
    }

    pub fn gc(&self) -> &GarbageCollector<S, I> {
        &self.gc
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl<S, I> Clone for TaggedCache<S, I>
where
    S: CacheStore,
    I: TagIndex,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            index: Arc::clone(&self.index),
            gc: self.gc.clone(),
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{MemoryStore, MemoryTagIndex};

    type MemoryCache = TaggedCache<MemoryStore, MemoryTagIndex>;

    fn create_test_cache(config: CacheConfig) -> MemoryCache {
        TaggedCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTagIndex::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_round_trip_with_tags() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("k", b"value".to_vec(), None, ["A"])
            .await
            .expect("set should succeed");

        assert_eq!(
            cache.get("k").await.expect("get should succeed"),
            Some(b"value".to_vec())
        );
    }

    #[tokio::test]
    async fn test_empty_value_round_trip() {
        let cache = create_test_cache(CacheConfig::default());
        cache.set("k", Vec::new(), None).await.expect("set should succeed");
        assert_eq!(cache.get("k").await.expect("get"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_tag_invalidation_completeness() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("k1", b"1".to_vec(), None, ["A"])
            .await
            .expect("set should succeed");
        cache
            .set_with_tags("k2", b"2".to_vec(), None, ["A", "B"])
            .await
            .expect("set should succeed");

        assert_eq!(cache.delete_tag("A").await.expect("delete_tag"), 2);

        assert!(cache.get("k1").await.expect("get").is_none());
        assert!(cache.get("k2").await.expect("get").is_none());

        // B still lists k2, but the entry is gone so it reads as not cached.
        let b_keys = cache.index().keys_for("B").await.expect("keys_for");
        assert_eq!(b_keys.into_iter().collect::<Vec<_>>(), vec!["k2"]);
        assert!(cache.find("B").await.expect("find").is_empty());
    }

    #[tokio::test]
    async fn test_independence_across_tags() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("a", b"1".to_vec(), None, ["A"])
            .await
            .expect("set should succeed");
        cache
            .set_with_tags("b", b"2".to_vec(), None, ["B"])
            .await
            .expect("set should succeed");

        cache.delete_tag("B").await.expect("delete_tag");
        assert_eq!(cache.get("a").await.expect("get"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_unknown_tag() {
        let cache = create_test_cache(CacheConfig::default());
        assert_eq!(cache.delete_tag("Nope").await.expect("delete_tag"), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_a_miss_and_collected() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("k", b"v".to_vec(), Some(Duration::ZERO), ["A"])
            .await
            .expect("set should succeed");

        assert!(cache.get("k").await.expect("get").is_none());
        let report = cache.collect().await.expect("collect should succeed");
        assert_eq!(report.expired_removed, 1);
        assert!(cache.index().keys_for("A").await.expect("keys_for").is_empty());
    }

    #[tokio::test]
    async fn test_default_ttl_applies_when_none() {
        let cache = create_test_cache(CacheConfig::default().with_default_ttl(Some(Duration::ZERO)));
        cache.set("k", b"v".to_vec(), None).await.expect("set should succeed");
        assert!(cache.get("k").await.expect("get").is_none());

        let cache = create_test_cache(CacheConfig::default().with_default_ttl(None));
        cache.set("k", b"v".to_vec(), None).await.expect("set should succeed");
        let stored = cache.store().peek("k").expect("peek").expect("entry");
        assert_eq!(stored.ttl, None);
    }

    #[tokio::test]
    async fn test_explicit_ttl_overrides_default() {
        let cache = create_test_cache(CacheConfig::default().with_default_ttl(Some(Duration::ZERO)));
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_secs(60)))
            .await
            .expect("set should succeed");
        assert!(cache.get("k").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_delete_key_leaves_tags_until_sweep() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("k", b"v".to_vec(), None, ["A"])
            .await
            .expect("set should succeed");

        assert!(cache.delete_key("k").await.expect("delete_key"));
        assert!(!cache.delete_key("k").await.expect("delete_key"));
        assert!(cache.get("k").await.expect("get").is_none());
        assert_eq!(cache.index().keys_for("A").await.expect("keys_for").len(), 1);

        let report = cache.collect().await.expect("collect should succeed");
        assert_eq!(report.dangling_detached, 1);
        assert!(cache.index().keys_for("A").await.expect("keys_for").is_empty());
    }

    #[tokio::test]
    async fn test_find_sorted_and_skips_dangling() {
        let cache = create_test_cache(CacheConfig::default());
        for key in ["c", "a", "b"] {
            cache
                .set_with_tags(key, key.as_bytes().to_vec(), None, ["T"])
                .await
                .expect("set should succeed");
        }
        cache.delete_key("b").await.expect("delete_key");

        let found = cache.find("T").await.expect("find");
        assert_eq!(
            found,
            vec![
                ("a".to_string(), b"a".to_vec()),
                ("c".to_string(), b"c".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_all() {
        let cache = create_test_cache(CacheConfig::default());
        cache
            .set_with_tags("k1", b"1".to_vec(), None, ["A"])
            .await
            .expect("set should succeed");
        cache.set("k2", b"2".to_vec(), None).await.expect("set should succeed");

        assert_eq!(cache.delete_all().await.expect("delete_all"), 2);
        assert!(cache.get("k1").await.expect("get").is_none());
        assert!(cache.index().tags().await.expect("tags").is_empty());
    }

    #[tokio::test]
    async fn test_miss_then_fill_then_invalidate() {
        let cache = create_test_cache(CacheConfig::default());
        let key = "select:posts";

        assert!(cache.get(key).await.expect("get").is_none());
        cache
            .set_with_tags(key, br#"[{"id":1}]"#.to_vec(), None, ["Post"])
            .await
            .expect("set should succeed");
        assert!(cache.get(key).await.expect("get").is_some());

        // An UPDATE on posts.
        cache.delete_tag("Post").await.expect("delete_tag");
        assert!(cache.get(key).await.expect("get").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.invalidated, 1);
    }

    #[tokio::test]
    async fn test_maybe_collect_configured_inline() {
        let cache = create_test_cache(CacheConfig::default().with_gc_probability_percent(100));
        cache
            .set("old", b"v".to_vec(), Some(Duration::ZERO))
            .await
            .expect("set should succeed");

        assert!(cache.maybe_collect_configured().await.expect("maybe_collect"));
        assert!(cache.store().peek("old").expect("peek").is_none());

        let never = create_test_cache(CacheConfig::default().with_gc_probability_percent(0));
        assert!(!never.maybe_collect_configured().await.expect("maybe_collect"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_key_writers() {
        let cache = create_test_cache(CacheConfig::default());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let key = format!("k{i}");
                    let tag = format!("T{i}");
                    cache
                        .set_with_tags(&key, vec![i as u8], None, [tag, "All".to_string()])
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle
                .await
                .expect("task should not panic")
                .expect("set should succeed");
        }

        for i in 0..32 {
            let keys = cache
                .index()
                .keys_for(&format!("T{i}"))
                .await
                .expect("keys_for");
            assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![format!("k{i}")]);
            assert_eq!(
                cache.get(&format!("k{i}")).await.expect("get"),
                Some(vec![i as u8])
            );
        }
        assert_eq!(cache.index().keys_for("All").await.expect("keys_for").len(), 32);
    }
}
