//! Garbage collection of expired entries and dangling tag references.
//!
//! Expired entries stay physically stored until a sweep removes them. A sweep
//! has two passes:
//!
//! 1. Forward: every key reported by [`CacheStore::scan_expired`] is removed
//!    and detached from the tags embedded in its entry.
//! 2. Reverse: every key listed under a tag is checked against the store and
//!    detached when no live entry backs it. This cleans references left by
//!    `delete_key`, TTL races and writes that crashed between the store write
//!    and the tag attach.
//!
//! Only a failure of the initial scan aborts a sweep. Per-item failures are
//! logged, counted in the [`GcReport`], and skipped.
//!
//! Sweeps are usually triggered probabilistically from the request path via
//! [`GarbageCollector::maybe_collect`], or periodically via [`run_sweeper`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tagcache_core::CacheResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::traits::{CacheStore, TagIndex};

// ============================================================================
// REPORT & METRICS
// ============================================================================

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired entries removed from the store.
    pub expired_removed: u64,
    /// Tag references detached because no live entry backed them.
    pub dangling_detached: u64,
    /// Individual steps that failed and were skipped.
    pub errors: u64,
}

impl GcReport {
    /// Whether the sweep changed nothing and hit no errors.
    pub fn is_empty(&self) -> bool {
        self.expired_removed == 0 && self.dangling_detached == 0 && self.errors == 0
    }
}

/// Cumulative sweep counters.
#[derive(Debug, Default)]
pub struct GcMetrics {
    /// Completed sweeps, including ones that removed nothing
    pub cycles: AtomicU64,

    /// Expired entries removed since startup
    pub expired_removed: AtomicU64,

    /// Dangling tag references detached since startup
    pub dangling_detached: AtomicU64,

    /// Skipped steps plus aborted sweeps
    pub errors: AtomicU64,
}

impl GcMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, report: &GcReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.expired_removed
            .fetch_add(report.expired_removed, Ordering::Relaxed);
        self.dangling_detached
            .fetch_add(report.dangling_detached, Ordering::Relaxed);
        self.errors.fetch_add(report.errors, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> GcMetricsSnapshot {
        GcMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            dangling_detached: self.dangling_detached.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetricsSnapshot {
    pub cycles: u64,
    pub expired_removed: u64,
    pub dangling_detached: u64,
    pub errors: u64,
}

// ============================================================================
// COLLECTOR
// ============================================================================

/// Roll the dice for a probabilistic sweep.
///
/// `probability` is clamped to `[0, 1]`; NaN counts as zero.
pub fn should_collect(probability: f64) -> bool {
    if probability.is_nan() || probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rand::random::<f64>() < probability
}

/// Sweeps a store and its tag index.
pub struct GarbageCollector<S, I>
where
    S: CacheStore,
    I: TagIndex,
{
    store: Arc<S>,
    index: Arc<I>,
    metrics: Arc<GcMetrics>,
}

impl<S, I> GarbageCollector<S, I>
where
    S: CacheStore + 'static,
    I: TagIndex + 'static,
{
    /// Create a collector over a store and index.
    pub fn new(store: Arc<S>, index: Arc<I>) -> Self {
        Self {
            store,
            index,
            metrics: Arc::new(GcMetrics::new()),
        }
    }

    /// Cumulative counters across all sweeps run by this collector and its clones.
    pub fn metrics(&self) -> &Arc<GcMetrics> {
        &self.metrics
    }

    /// Run a sweep with the given probability.
    ///
    /// Returns whether a sweep ran.
    pub async fn maybe_collect(&self, probability: f64) -> CacheResult<bool> {
        if !should_collect(probability) {
            return Ok(false);
        }
        self.collect().await?;
        Ok(true)
    }

    /// Decide inline, sweep on a background task.
    ///
    /// Must be called from within a tokio runtime. Returns the task handle if
    /// a sweep was started.
    pub fn spawn_maybe_collect(&self, probability: f64) -> Option<JoinHandle<CacheResult<GcReport>>> {
        if !should_collect(probability) {
            return None;
        }
        let gc = self.clone();
        Some(tokio::spawn(async move { gc.collect().await }))
    }

    /// Run one full sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot be scanned at all.
    pub async fn collect(&self) -> CacheResult<GcReport> {
        let now = Utc::now();
        let expired = match self.store.scan_expired(now).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "Cache sweep aborted: store scan failed");
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut report = GcReport::default();

        for key in expired {
            let entry = match self.store.remove_expired(&key, now).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::trace!(key = %key, "Expired entry already gone or refreshed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to remove expired entry");
                    report.errors += 1;
                    continue;
                }
            };
            report.expired_removed += 1;

            for tag in &entry.tags {
                if let Err(e) = self.detach_expired(tag, &key).await {
                    tracing::warn!(key = %key, tag = %tag, error = %e, "Failed to detach expired key");
                    report.errors += 1;
                }
            }
        }

        self.detach_dangling(&mut report).await;

        self.metrics.record(&report);
        if report.expired_removed > 0 || report.dangling_detached > 0 {
            tracing::info!(
                expired_removed = report.expired_removed,
                dangling_detached = report.dangling_detached,
                errors = report.errors,
                "Cache sweep completed"
            );
        } else {
            tracing::trace!(errors = report.errors, "Cache sweep completed with nothing to remove");
        }

        Ok(report)
    }

    async fn detach_dangling(&self, report: &mut GcReport) {
        let tags = match self.index.tags().await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list tags, skipping reverse scan");
                report.errors += 1;
                return;
            }
        };

        for tag in tags {
            let keys = match self.index.keys_for(&tag).await {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Failed to read tag");
                    report.errors += 1;
                    continue;
                }
            };

            for key in keys {
                match self.detach_if_dangling(&tag, &key).await {
                    Ok(true) => report.dangling_detached += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(tag = %tag, key = %key, error = %e, "Failed to check tag reference");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    async fn detach_expired(&self, tag: &str, key: &str) -> CacheResult<()> {
        if !self.index.detach(tag, key).await? {
            return Ok(());
        }
        // A writer may have stored the key again after the removal; its
        // attach was a no-op, so restore the membership.
        if self.store.contains(key).await? {
            tracing::debug!(key = %key, tag = %tag, "Expired key rewritten during sweep, keeping tag");
            self.index.attach(tag, key).await?;
        }
        Ok(())
    }

    async fn detach_if_dangling(&self, tag: &str, key: &str) -> CacheResult<bool> {
        if self.store.contains(key).await? {
            return Ok(false);
        }
        if !self.index.detach(tag, key).await? {
            return Ok(false);
        }
        // A writer may have stored the key again between the check and the
        // detach; its attach was a no-op, so restore the membership.
        if self.store.contains(key).await? {
            self.index.attach(tag, key).await?;
            return Ok(false);
        }
        Ok(true)
    }
}

impl<S, I> Clone for GarbageCollector<S, I>
where
    S: CacheStore,
    I: TagIndex,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            index: Arc::clone(&self.index),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Shortest interval accepted by [`run_sweeper`].
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Sweep every `every` until the shutdown signal flips to true or its sender
/// is dropped.
///
/// Intervals shorter than [`MIN_SWEEP_INTERVAL`], including zero, are raised
/// to it.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(run_sweeper(cache.gc().clone(), Duration::from_secs(300), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let totals = handle.await?;
/// ```
pub async fn run_sweeper<S, I>(
    gc: GarbageCollector<S, I>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> GcMetricsSnapshot
where
    S: CacheStore + 'static,
    I: TagIndex + 'static,
{
    let every = every.max(MIN_SWEEP_INTERVAL);
    let mut sweep_interval = interval(every);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = every.as_millis() as u64, "Cache sweeper started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache sweeper shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                // Failures are already logged and counted by collect.
                let _ = gc.collect().await;
            }
        }
    }

    let snapshot = gc.metrics().snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        expired_removed = snapshot.expired_removed,
        dangling_detached = snapshot.dangling_detached,
        errors = snapshot.errors,
        "Cache sweeper completed"
    );
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{MemoryStore, MemoryTagIndex};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tagcache_core::CacheEntry;

    /// Tag index that lets a writer store and attach an entry right before
    /// the first detach it sees.
    struct RewriteBeforeDetach {
        inner: MemoryTagIndex,
        store: Arc<MemoryStore>,
        pending: Mutex<Option<CacheEntry>>,
    }

    #[async_trait]
    impl TagIndex for RewriteBeforeDetach {
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
            let pending = self.pending.lock().expect("pending lock").take();
            if let Some(entry) = pending {
                self.store.put(&entry).await?;
                self.inner.attach_all(&entry.tags, &entry.key).await?;
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

    fn create_test_gc() -> (GarbageCollector<MemoryStore, MemoryTagIndex>, Arc<MemoryStore>, Arc<MemoryTagIndex>) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryTagIndex::new());
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::clone(&index));
        (gc, store, index)
    }

    async fn put_tagged(
        store: &MemoryStore,
        index: &MemoryTagIndex,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
    ) {
        let entry = CacheEntry::new(key, b"v".to_vec(), ttl).with_tags(tags.iter().copied());
        store.put(&entry).await.expect("put should succeed");
        index
            .attach_all(&entry.tags, key)
            .await
            .expect("attach should succeed");
    }

    #[test]
    fn test_should_collect_bounds() {
        for _ in 0..100 {
            assert!(!should_collect(0.0));
            assert!(!should_collect(-1.0));
            assert!(!should_collect(f64::NAN));
            assert!(should_collect(1.0));
            assert!(should_collect(7.5));
        }
    }

    #[tokio::test]
    async fn test_collect_removes_expired_and_detaches() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A", "B"]).await;
        put_tagged(&store, &index, "live", None, &["A"]).await;

        let report = gc.collect().await.expect("collect should succeed");
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.errors, 0);

        assert!(store.peek("old").expect("peek").is_none());
        assert!(store.contains("live").await.expect("contains"));
        let keys = index.keys_for("A").await.expect("keys_for");
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["live"]);
        assert!(index.keys_for("B").await.expect("keys_for").is_empty());
    }

    #[tokio::test]
    async fn test_collect_never_removes_live_entries() {
        let (gc, store, index) = create_test_gc();
        for i in 0..10 {
            put_tagged(&store, &index, &format!("k{i}"), Some(Duration::from_secs(3600)), &["A"]).await;
        }

        let report = gc.collect().await.expect("collect should succeed");
        assert!(report.is_empty());
        assert_eq!(store.len().await.expect("len"), 10);
        assert_eq!(index.keys_for("A").await.expect("keys_for").len(), 10);
    }

    #[tokio::test]
    async fn test_collect_detaches_dangling_keys() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "k1", None, &["Post"]).await;
        index.attach("Post", "ghost").await.expect("attach should succeed");
        store.remove("k1").await.expect("remove should succeed");

        let report = gc.collect().await.expect("collect should succeed");
        assert_eq!(report.dangling_detached, 2);
        assert!(index.keys_for("Post").await.expect("keys_for").is_empty());
        assert!(index.tags().await.expect("tags").is_empty());
    }

    #[tokio::test]
    async fn test_collect_keeps_tag_of_key_rewritten_mid_sweep() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(RewriteBeforeDetach {
            inner: MemoryTagIndex::new(),
            store: Arc::clone(&store),
            pending: Mutex::new(None),
        });
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::clone(&index));

        let stale = CacheEntry::new("k", b"stale".to_vec(), Some(Duration::ZERO)).with_tags(["Post"]);
        store.put(&stale).await.expect("put should succeed");
        index.attach("Post", "k").await.expect("attach should succeed");

        let fresh = CacheEntry::new("k", b"fresh".to_vec(), None).with_tags(["Post"]);
        *index.pending.lock().expect("pending lock") = Some(fresh);

        let report = gc.collect().await.expect("collect should succeed");
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.errors, 0);

        let entry = store.get("k").await.expect("get").expect("fresh entry survives");
        assert_eq!(entry.value, b"fresh".to_vec());
        let keys = index.keys_for("Post").await.expect("keys_for");
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["k"]);

        let invalidated = index.detach_all("Post").await.expect("detach_all");
        assert!(invalidated.contains("k"));
    }

    #[tokio::test]
    async fn test_maybe_collect_probability_extremes() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A"]).await;

        assert!(!gc.maybe_collect(0.0).await.expect("maybe_collect"));
        assert!(store.peek("old").expect("peek").is_some());

        assert!(gc.maybe_collect(1.0).await.expect("maybe_collect"));
        assert!(store.peek("old").expect("peek").is_none());
    }

    #[tokio::test]
    async fn test_spawn_maybe_collect() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A"]).await;

        assert!(gc.spawn_maybe_collect(0.0).is_none());
        let handle = gc.spawn_maybe_collect(1.0).expect("sweep should start");
        let report = handle
            .await
            .expect("task should not panic")
            .expect("collect should succeed");
        assert_eq!(report.expired_removed, 1);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A"]).await;

        gc.collect().await.expect("collect should succeed");
        gc.clone().collect().await.expect("collect should succeed");

        let snapshot = gc.metrics().snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.expired_removed, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn test_run_sweeper_stops_on_shutdown() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A"]).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(gc, Duration::from_millis(10), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("sweeper should be listening");

        let snapshot = handle.await.expect("sweeper should not panic");
        assert!(snapshot.cycles >= 1);
        assert_eq!(snapshot.expired_removed, 1);
        assert!(store.peek("old").expect("peek").is_none());
    }

    #[tokio::test]
    async fn test_run_sweeper_accepts_zero_interval() {
        let (gc, store, index) = create_test_gc();
        put_tagged(&store, &index, "old", Some(Duration::ZERO), &["A"]).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(gc, Duration::ZERO, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).expect("sweeper should be listening");

        let snapshot = handle.await.expect("zero interval must not panic");
        assert!(snapshot.cycles >= 1);
        assert_eq!(snapshot.expired_removed, 1);
    }

    #[tokio::test]
    async fn test_run_sweeper_stops_when_sender_dropped() {
        let (gc, _store, _index) = create_test_gc();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        let snapshot = run_sweeper(gc, Duration::from_secs(3600), shutdown_rx).await;
        assert!(snapshot.cycles <= 1);
    }
}
