//! In-memory store and tag index.
//!
//! Used for tests, for embedding the cache in short-lived processes, and as
//! the reference behaviour the LMDB backend is checked against.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use tagcache_core::{CacheEntry, CacheResult, StorageError, Timestamp};

use super::traits::{CacheStore, TagIndex};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StorageError> {
    lock.read().map_err(|_| StorageError::LockPoisoned)
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StorageError> {
    lock.write().map_err(|_| StorageError::LockPoisoned)
}

/// In-memory entry store.
///
/// Entries are replaced whole under the write lock, so readers never see a
/// partially written value.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an entry regardless of expiry. Intended for tests and tooling.
    pub fn peek(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(read(&self.entries)?.get(key).cloned())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        let entries = read(&self.entries)?;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        write(&self.entries)?.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(write(&self.entries)?.remove(key))
    }

    async fn remove_expired(&self, key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>> {
        let mut entries = write(&self.entries)?;
        if entries.get(key).is_some_and(|entry| entry.is_expired_at(now)) {
            Ok(entries.remove(key))
        } else {
            Ok(None)
        }
    }

    async fn scan_expired(&self, now: Timestamp) -> CacheResult<Vec<String>> {
        let entries = read(&self.entries)?;
        let mut expired: Vec<String> = entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();
        expired.sort();
        Ok(expired)
    }

    async fn len(&self) -> CacheResult<u64> {
        Ok(read(&self.entries)?.len() as u64)
    }

    async fn clear(&self) -> CacheResult<u64> {
        let mut entries = write(&self.entries)?;
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }
}

/// In-memory tag index.
#[derive(Debug, Default, Clone)]
pub struct MemoryTagIndex {
    tags: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl MemoryTagIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TagIndex for MemoryTagIndex {
    async fn attach(&self, tag: &str, key: &str) -> CacheResult<()> {
        write(&self.tags)?
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn keys_for(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        Ok(read(&self.tags)?
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn detach_all(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        Ok(write(&self.tags)?
            .remove(tag)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default())
    }

    async fn detach(&self, tag: &str, key: &str) -> CacheResult<bool> {
        let mut tags = write(&self.tags)?;
        let Some(keys) = tags.get_mut(tag) else {
            return Ok(false);
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            tags.remove(tag);
        }
        Ok(removed)
    }

    async fn tags(&self) -> CacheResult<Vec<String>> {
        let mut tags: Vec<String> = read(&self.tags)?.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    async fn clear(&self) -> CacheResult<()> {
        write(&self.tags)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();
        let entry = CacheEntry::new("k", b"v".to_vec(), None).with_tags(["A"]);
        store.put(&entry).await.expect("put should succeed");

        let cached = store.get("k").await.expect("get should succeed");
        assert_eq!(cached, Some(entry));
        assert!(store.contains("k").await.expect("contains should succeed"));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_hidden_but_scanned() {
        let store = MemoryStore::new();
        let entry = CacheEntry::new("old", b"v".to_vec(), Some(Duration::ZERO));
        store.put(&entry).await.expect("put should succeed");

        assert!(store.get("old").await.expect("get should succeed").is_none());
        assert_eq!(store.len().await.expect("len should succeed"), 1);
        assert_eq!(
            store.scan_expired_now().await.expect("scan should succeed"),
            vec!["old".to_string()]
        );
        assert!(store.peek("old").expect("peek should succeed").is_some());
    }

    #[tokio::test]
    async fn test_remove_returns_entry_and_is_idempotent() {
        let store = MemoryStore::new();
        let entry = CacheEntry::new("k", b"v".to_vec(), None).with_tags(["A", "B"]);
        store.put(&entry).await.expect("put should succeed");

        let removed = store.remove("k").await.expect("remove should succeed");
        assert_eq!(removed.map(|e| e.tags.len()), Some(2));
        assert!(store.remove("k").await.expect("remove should succeed").is_none());
    }

    #[tokio::test]
    async fn test_remove_expired_spares_live_entry() {
        let store = MemoryStore::new();
        store
            .put(&CacheEntry::new("old", b"v".to_vec(), Some(Duration::ZERO)))
            .await
            .expect("put should succeed");
        store
            .put(&CacheEntry::new("live", b"v".to_vec(), None))
            .await
            .expect("put should succeed");

        let now = Utc::now();
        assert!(store
            .remove_expired("old", now)
            .await
            .expect("remove_expired should succeed")
            .is_some());
        assert!(store
            .remove_expired("live", now)
            .await
            .expect("remove_expired should succeed")
            .is_none());
        assert!(store.contains("live").await.expect("contains should succeed"));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let store = MemoryStore::new();
        store
            .put(&CacheEntry::new("k", b"first".to_vec(), None))
            .await
            .expect("put should succeed");
        store
            .put(&CacheEntry::new("k", b"second".to_vec(), None))
            .await
            .expect("put should succeed");

        let cached = store.get("k").await.expect("get should succeed");
        assert_eq!(cached.map(|e| e.value), Some(b"second".to_vec()));
        assert_eq!(store.len().await.expect("len should succeed"), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .put(&CacheEntry::new(format!("k{i}"), Vec::new(), None))
                .await
                .expect("put should succeed");
        }
        assert_eq!(store.clear().await.expect("clear should succeed"), 3);
        assert!(store.is_empty().await.expect("is_empty should succeed"));
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let index = MemoryTagIndex::new();
        index.attach("Post", "k1").await.expect("attach should succeed");
        index.attach("Post", "k1").await.expect("attach should succeed");

        let keys = index.keys_for("Post").await.expect("keys_for should succeed");
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("k1"));
    }

    #[tokio::test]
    async fn test_keys_for_unknown_tag_is_empty() {
        let index = MemoryTagIndex::new();
        assert!(index
            .keys_for("Nope")
            .await
            .expect("keys_for should succeed")
            .is_empty());
    }

    #[tokio::test]
    async fn test_detach_all_clears_tag() {
        let index = MemoryTagIndex::new();
        index.attach("Post", "k1").await.expect("attach should succeed");
        index.attach("Post", "k2").await.expect("attach should succeed");
        index.attach("User", "k3").await.expect("attach should succeed");

        let removed = index.detach_all("Post").await.expect("detach_all should succeed");
        assert_eq!(removed.len(), 2);
        assert!(index.keys_for("Post").await.expect("keys_for").is_empty());
        assert_eq!(index.keys_for("User").await.expect("keys_for").len(), 1);
        assert_eq!(index.tags().await.expect("tags"), vec!["User".to_string()]);
    }

    #[tokio::test]
    async fn test_detach_prunes_empty_tag() {
        let index = MemoryTagIndex::new();
        index.attach("Post", "k1").await.expect("attach should succeed");

        assert!(index.detach("Post", "k1").await.expect("detach should succeed"));
        assert!(!index.detach("Post", "k1").await.expect("detach should succeed"));
        assert!(index.tags().await.expect("tags").is_empty());
    }
}
