//! Read-through query executor.
//!
//! [`CachedExecutor`] sits between callers and a [`QueryRunner`]. Reads are
//! fingerprinted and served from the cache when possible; writes run against
//! the runner and then invalidate every model they touch.
//!
//! The cache is never allowed to make a read fail: storage errors and
//! undecodable payloads fall back to running the query. Invalidation after a
//! write is different. The write already happened, so a failed invalidation
//! is returned to the caller instead of being swallowed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tagcache_core::{
    CacheError, CacheResult, FingerprintScope, Mutation, Query, StorageError,
};

use super::tagged::TaggedCache;
use super::traits::{CacheStore, TagIndex};

/// The database side of a cached executor.
///
/// # Example
///
/// ```ignore
/// struct PgRunner { pool: PgPool }
///
/// #[async_trait]
/// impl QueryRunner for PgRunner {
///     type Row = serde_json::Value;
///     async fn fetch_rows(&self, query: &Query) -> CacheResult<Vec<Self::Row>> { ... }
///     async fn fetch_count(&self, query: &Query) -> CacheResult<u64> { ... }
///     async fn execute(&self, mutation: &Mutation) -> CacheResult<u64> { ... }
/// }
/// ```
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Row type. Cached rows are stored as JSON.
    type Row: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Run a SELECT.
    async fn fetch_rows(&self, query: &Query) -> CacheResult<Vec<Self::Row>>;

    /// Run the COUNT form of a query.
    async fn fetch_count(&self, query: &Query) -> CacheResult<u64>;

    /// Run an INSERT, UPDATE or DELETE. Returns the affected row count.
    async fn execute(&self, mutation: &Mutation) -> CacheResult<u64>;
}

type FlightMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Executor that caches reads by fingerprint and invalidates by model.
///
/// # Type Parameters
///
/// - `S`: The store holding cached results
/// - `I`: The tag index mapping models to cached fingerprints
/// - `R`: The runner that talks to the database
pub struct CachedExecutor<S, I, R>
where
    S: CacheStore,
    I: TagIndex,
    R: QueryRunner,
{
    cache: TaggedCache<S, I>,
    runner: Arc<R>,
    in_flight: FlightMap,
}

impl<S, I, R> CachedExecutor<S, I, R>
where
    S: CacheStore + 'static,
    I: TagIndex + 'static,
    R: QueryRunner,
{
    /// Create an executor over a cache and a runner.
    pub fn new(cache: TaggedCache<S, I>, runner: Arc<R>) -> Self {
        Self {
            cache,
            runner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rows for `query`, from cache or from the runner.
    pub async fn select(&self, query: &Query) -> CacheResult<Vec<R::Row>> {
        self.read_through(query, FingerprintScope::Select, || {
            self.runner.fetch_rows(query)
        })
        .await
    }

    /// Row count for `query`. Cached separately from `select` on the same SQL.
    pub async fn count(&self, query: &Query) -> CacheResult<u64> {
        self.read_through(query, FingerprintScope::Count, || {
            self.runner.fetch_count(query)
        })
        .await
    }

    /// Run a write and invalidate every model it touches.
    ///
    /// # Errors
    ///
    /// Returns the runner's error if the write failed, or the first
    /// invalidation error if the write succeeded but cached results for one of
    /// its models could not be removed.
    pub async fn execute(&self, mutation: &Mutation) -> CacheResult<u64> {
        let affected = self.runner.execute(mutation).await?;

        let mut first_error: Option<CacheError> = None;
        for model in &mutation.models {
            if let Err(e) = self.cache.delete_tag(model).await {
                tracing::error!(
                    model = %model,
                    kind = ?mutation.kind,
                    error = %e,
                    "Write succeeded but cache invalidation failed"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(affected),
        }
    }

    pub fn cache(&self) -> &TaggedCache<S, I> {
        &self.cache
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    async fn read_through<T, F, Fut>(
        &self,
        query: &Query,
        scope: FingerprintScope,
        fetch: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        if let Err(e) = self.cache.maybe_collect_configured().await {
            tracing::warn!(error = %e, "Cache sweep failed");
        }

        if !self.cache.config().enabled {
            return fetch().await;
        }

        let fingerprint = query.fingerprint(scope);
        let key = fingerprint.as_str();
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        let flight = self.take_off(key)?;
        let result = {
            let _guard = flight.lock().await;
            // Another caller may have filled the entry while we waited.
            match self.lookup(key).await {
                Some(value) => Ok(value),
                None => self.fill(key, query, fetch).await,
            }
        };
        self.land(key, flight);
        result
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.cache.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, running query uncached");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping undecodable cached result");
                if let Err(e) = self.cache.delete_key(key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to drop undecodable cached result");
                }
                None
            }
        }
    }

    async fn fill<T, F, Fut>(&self, key: &str, query: &Query, fetch: F) -> CacheResult<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let value = fetch().await?;

        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = self
                    .cache
                    .set_with_tags(key, bytes, None, query.tags())
                    .await
                {
                    tracing::warn!(key = %key, error = %e, "Failed to cache query result");
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Query result is not serializable, not cached");
            }
        }

        Ok(value)
    }

    /// Per-fingerprint lock so concurrent misses run the query once.
    fn take_off(&self, key: &str) -> CacheResult<Arc<tokio::sync::Mutex<()>>> {
        let mut flights = self
            .in_flight
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(Arc::clone(flights.entry(key.to_string()).or_default()))
    }

    fn land(&self, key: &str, flight: Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut flights) = self.in_flight.lock() else {
            return;
        };
        drop(flight);
        // Only the map still holds it: nobody else is waiting.
        if flights.get(key).is_some_and(|f| Arc::strong_count(f) == 1) {
            flights.remove(key);
        }
    }
}

impl<S, I, R> Clone for CachedExecutor<S, I, R>
where
    S: CacheStore,
    I: TagIndex,
    R: QueryRunner,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            runner: Arc::clone(&self.runner),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}
