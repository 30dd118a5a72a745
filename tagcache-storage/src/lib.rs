//! TAGCACHE Storage - Stores, Tag Index, Sweeper and Cached Executor
//!
//! Everything that touches cached data lives here. Plain types (entries,
//! fingerprints, config, errors) come from `tagcache-core`.

pub mod cache;
pub mod mock;

pub use cache::{
    run_sweeper, CacheStats, CacheStore, CachedExecutor, GarbageCollector, GcMetrics,
    GcMetricsSnapshot, GcReport, LmdbBackend, LmdbCacheError, LmdbStore, LmdbTagIndex,
    MemoryStore, MemoryTagIndex, QueryRunner, StoreSchema, TagIndex, TaggedCache,
};
pub use mock::MockRunner;
