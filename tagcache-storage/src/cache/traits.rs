//! Store and tag index traits.
//!
//! This module defines the two seams of the cache: the key/value store that
//! owns entries and the tag index that maps tags to keys. The facade composes
//! one of each.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tagcache_core::{CacheEntry, CacheResult, Timestamp};

/// Key/value store for cache entries.
///
/// Implementations must be thread-safe. A write to one key is atomic: a
/// concurrent `get` sees either the previous entry or the new one, never a
/// mix.
///
/// # Expiry
///
/// `get` and `contains` must never report an expired entry. Expired entries
/// may stay physically stored until `remove` is called for them, which is
/// what the garbage collector does with the keys from `scan_expired`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live entry, or None if absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Store an entry, replacing any previous entry under the same key.
    async fn put(&self, entry: &CacheEntry) -> CacheResult<()>;

    /// Remove an entry.
    ///
    /// Returns the removed entry, expired or not, so the caller can cascade
    /// tag cleanup. Removing an absent key is a no-op returning None. An
    /// entry that could not be decoded is still removed and reported with an
    /// empty value and no tags.
    async fn remove(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Remove an entry only if it is still expired at `now`.
    ///
    /// The check and the removal are one atomic step, so an entry rewritten
    /// after `scan_expired` listed it survives.
    async fn remove_expired(&self, key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>>;

    /// Keys of all entries whose expiry is at or before `now`.
    async fn scan_expired(&self, now: Timestamp) -> CacheResult<Vec<String>>;

    /// Number of stored entries, counting expired ones not yet swept.
    async fn len(&self) -> CacheResult<u64>;

    /// Remove every entry. Returns how many were removed.
    async fn clear(&self) -> CacheResult<u64>;

    /// Whether a live entry exists under `key`.
    async fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Whether the store holds no entries.
    async fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Expired keys as of the current instant.
    async fn scan_expired_now(&self) -> CacheResult<Vec<String>> {
        self.scan_expired(Utc::now()).await
    }
}

/// Index from tag to the set of cache keys filed under it.
///
/// Tags are opaque caller strings, typically model names. The index never
/// owns entries: a key listed under a tag may already be gone from the
/// store, and callers treat that as "not cached".
#[async_trait]
pub trait TagIndex: Send + Sync {
    /// File `key` under `tag`. Attaching the same pair twice has no effect.
    async fn attach(&self, tag: &str, key: &str) -> CacheResult<()>;

    /// Keys filed under `tag`; empty for an unknown tag.
    async fn keys_for(&self, tag: &str) -> CacheResult<BTreeSet<String>>;

    /// Atomically clear `tag` and return the keys it held.
    async fn detach_all(&self, tag: &str) -> CacheResult<BTreeSet<String>>;

    /// Remove a single key from a tag. Returns whether it was present.
    async fn detach(&self, tag: &str, key: &str) -> CacheResult<bool>;

    /// All tags that currently hold at least one key.
    async fn tags(&self) -> CacheResult<Vec<String>>;

    /// Drop every tag.
    async fn clear(&self) -> CacheResult<()>;

    /// File `key` under each of `tags`.
    async fn attach_all(&self, tags: &BTreeSet<String>, key: &str) -> CacheResult<()> {
        for tag in tags {
            self.attach(tag, key).await?;
        }
        Ok(())
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries written.
    pub writes: u64,
    /// Number of entries removed through tag invalidation.
    pub invalidated: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
