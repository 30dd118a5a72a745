//! TAGCACHE Test Utilities
//!
//! Shared test infrastructure for the TAGCACHE workspace:
//! - Proptest generators for keys, tags and values
//! - Ready-made caches over both backends
//! - Store and tag index wrappers that fail on demand
//! - A tracing subscriber for test output

// Re-export the mock runner from its source crate
pub use tagcache_storage::MockRunner;

// Re-export core types for convenience
pub use tagcache_core::{
    CacheConfig, CacheEntry, CacheError, CacheResult, ConfigError, Fingerprint,
    FingerprintScope, Mutation, MutationKind, Query, StorageError,
};

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, RwLock};

use async_trait::async_trait;
use tagcache_core::Timestamp;
use tagcache_storage::{
    CacheStore, CachedExecutor, LmdbBackend, LmdbStore, LmdbTagIndex, MemoryStore,
    MemoryTagIndex, TagIndex, TaggedCache,
};
use tempfile::TempDir;

pub type MemoryCache = TaggedCache<MemoryStore, MemoryTagIndex>;
pub type LmdbCache = TaggedCache<LmdbStore, LmdbTagIndex>;

// ============================================================================
// FIXTURES
// ============================================================================

/// Config for tests: GC never triggers on its own.
pub fn test_config() -> CacheConfig {
    CacheConfig::new()
        .with_schema(CacheConfig::default_schema())
        .with_map_size_mb(10)
        .with_gc_probability_percent(0)
}

/// Cache over the in-memory backend.
pub fn memory_cache(config: CacheConfig) -> MemoryCache {
    TaggedCache::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryTagIndex::new()),
        config,
    )
}

/// Cache over a fresh LMDB environment in a temporary directory.
///
/// Keep the returned [`TempDir`] alive for as long as the cache is used.
///
/// # Panics
///
/// Panics if the temporary directory or the environment cannot be created.
pub fn lmdb_cache(config: CacheConfig) -> (LmdbCache, TempDir) {
    let temp_dir = TempDir::new().expect("TempDir creation should succeed");
    let config = config.with_path(temp_dir.path());
    let backend = LmdbBackend::open(&config.storage).expect("backend creation should succeed");
    let cache = TaggedCache::new(
        Arc::new(backend.store()),
        Arc::new(backend.tag_index()),
        config,
    );
    (cache, temp_dir)
}

/// Executor over the in-memory backend and a [`MockRunner`].
pub fn memory_executor(
    config: CacheConfig,
    runner: MockRunner,
) -> CachedExecutor<MemoryStore, MemoryTagIndex, MockRunner> {
    CachedExecutor::new(memory_cache(config), Arc::new(runner))
}

/// Install a tracing subscriber once per test binary.
///
/// Filter with `RUST_LOG`, e.g. `RUST_LOG=tagcache_storage=debug`.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FAILURE INJECTION
// ============================================================================

fn injected(what: String) -> CacheError {
    StorageError::Unavailable {
        reason: format!("injected failure: {what}"),
    }
    .into()
}

fn listed(set: &RwLock<HashSet<String>>, item: &str) -> bool {
    set.read().map(|s| s.contains(item)).unwrap_or(true)
}

/// Store wrapper that fails chosen operations.
///
/// Reads can be failed wholesale; removals fail per key. Everything else
/// passes through to the wrapped store.
pub struct FailingStore<S> {
    inner: Arc<S>,
    fail_reads: AtomicBool,
    fail_removes: RwLock<HashSet<String>>,
}

impl<S: CacheStore> FailingStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_removes: RwLock::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Make every `get` (and so `contains`) fail while set.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `remove` and `remove_expired` of `key` fail.
    pub fn fail_removes_of(&self, key: &str) {
        if let Ok(mut keys) = self.fail_removes.write() {
            keys.insert(key.to_string());
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for FailingStore<S> {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(injected(format!("get {key}")));
        }
        self.inner.get(key).await
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        if listed(&self.fail_removes, key) {
            return Err(injected(format!("remove {key}")));
        }
        self.inner.remove(key).await
    }

    async fn remove_expired(&self, key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>> {
        if listed(&self.fail_removes, key) {
            return Err(injected(format!("remove {key}")));
        }
        self.inner.remove_expired(key, now).await
    }

    async fn scan_expired(&self, now: Timestamp) -> CacheResult<Vec<String>> {
        self.inner.scan_expired(now).await
    }

    async fn len(&self) -> CacheResult<u64> {
        self.inner.len().await
    }

    async fn clear(&self) -> CacheResult<u64> {
        self.inner.clear().await
    }
}

/// Tag index wrapper whose `detach` fails for chosen tags.
pub struct FailingTagIndex<I> {
    inner: Arc<I>,
    fail_detaches: RwLock<HashSet<String>>,
}

impl<I: TagIndex> FailingTagIndex<I> {
    pub fn new(inner: Arc<I>) -> Self {
        Self {
            inner,
            fail_detaches: RwLock::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &Arc<I> {
        &self.inner
    }

    /// Make `detach` of any key from `tag` fail.
    pub fn fail_detaches_on(&self, tag: &str) {
        if let Ok(mut tags) = self.fail_detaches.write() {
            tags.insert(tag.to_string());
        }
    }
}

#[async_trait]
impl<I: TagIndex> TagIndex for FailingTagIndex<I> {
    async fn attach(&self, tag: &str, key: &str) -> CacheResult<()> {
        self.inner.attach(tag, key).await
    }

    async fn keys_for(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        self.inner.keys_for(tag).await
    }

    async fn detach_all(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        self.inner.detach_all(tag).await
    }

    async fn detach(&self, tag: &str, key: &str) -> CacheResult<bool> {
        if listed(&self.fail_detaches, tag) {
            return Err(injected(format!("detach {key} from {tag}")));
        }
        self.inner.detach(tag, key).await
    }

    async fn tags(&self) -> CacheResult<Vec<String>> {
        self.inner.tags().await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.clear().await
    }
}

pub type FailingMemoryCache =
    TaggedCache<FailingStore<MemoryStore>, FailingTagIndex<MemoryTagIndex>>;

/// In-memory cache whose store and index can be told to fail.
pub fn failing_memory_cache(config: CacheConfig) -> FailingMemoryCache {
    TaggedCache::new(
        Arc::new(FailingStore::new(Arc::new(MemoryStore::new()))),
        Arc::new(FailingTagIndex::new(Arc::new(MemoryTagIndex::new()))),
        config,
    )
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use proptest::prelude::*;
    use std::collections::BTreeSet;

    /// Model-like tag names.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,8}"
    }

    /// Up to `max` distinct tags.
    pub fn arb_tag_set(max: usize) -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set(arb_tag(), 0..=max)
    }

    /// Cache keys shaped like fingerprints or free-form names.
    pub fn arb_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "(select|count):[0-9a-f]{64}",
            "[a-z0-9_:]{1,40}",
        ]
    }

    /// Arbitrary payloads, including empty ones.
    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512)
    }

    /// JSON scalars as bound query parameters.
    pub fn arb_param() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,20}".prop_map(serde_json::Value::from),
        ]
    }
}
