//! Tag-indexed result cache.
//!
//! Cached values live in a [`CacheStore`] under content-derived keys; a
//! [`TagIndex`] files each key under the tags (usually model names) whose
//! writes must invalidate it. [`TaggedCache`] composes the two, the
//! [`GarbageCollector`] sweeps what expired or dangles, and
//! [`CachedExecutor`] wires it all in front of a [`QueryRunner`].
//!
//! # Backends
//!
//! - [`MemoryStore`] / [`MemoryTagIndex`]: process-local, for tests and
//!   short-lived processes
//! - [`LmdbBackend`]: persistent, one LMDB environment per directory
//!
//! # Example
//!
//! ```ignore
//! let config = CacheConfig::from_env()?;
//! let backend = LmdbBackend::open(&config.storage)?;
//! let cache = TaggedCache::new(Arc::new(backend.store()), Arc::new(backend.tag_index()), config);
//! let executor = CachedExecutor::new(cache, Arc::new(runner));
//!
//! let posts = executor.select(&Query::new("Post", "SELECT * FROM posts")).await?;
//! executor.execute(&Mutation::update("Post", "UPDATE posts SET title = ?").bind("x")).await?;
//! ```

pub mod gc;
pub mod lmdb_backend;
pub mod memory;
pub mod read_through;
pub mod schema;
pub mod tagged;
pub mod traits;

pub use gc::{
    run_sweeper, should_collect, GarbageCollector, GcMetrics, GcMetricsSnapshot, GcReport,
    MIN_SWEEP_INTERVAL,
};
pub use lmdb_backend::{LmdbBackend, LmdbCacheError, LmdbStore, LmdbTagIndex};
pub use memory::{MemoryStore, MemoryTagIndex};
pub use read_through::{CachedExecutor, QueryRunner};
pub use schema::StoreSchema;
pub use tagged::TaggedCache;
pub use traits::{CacheStats, CacheStore, TagIndex};
