//! In-memory query runner for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tagcache_core::{CacheResult, Mutation, MutationKind, Query, QueryError};

use crate::cache::QueryRunner;

/// Runner over an in-memory table per model.
///
/// Rows are JSON values. A query returns the rows of every model it reads,
/// in model order, and counts every call so tests can tell hits from misses.
///
/// Mutations are interpreted coarsely: an insert appends its first bound
/// parameter to each touched model, an update replaces every row of each
/// touched model with it, and a delete empties the touched models.
#[derive(Debug, Default, Clone)]
pub struct MockRunner {
    tables: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    row_fetches: Arc<AtomicU64>,
    count_fetches: Arc<AtomicU64>,
    executions: Arc<AtomicU64>,
    fail_next: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl MockRunner {
    /// Create a new runner with empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add a row to a model's table without counting it as an execution.
    pub fn seed(&self, model: &str, row: Value) {
        if let Ok(mut tables) = self.tables.write() {
            tables.entry(model.to_string()).or_default().push(row);
        }
    }

    /// Make the next call fail with [`QueryError::ExecutionFailed`].
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of `fetch_rows` calls.
    pub fn row_fetches(&self) -> u64 {
        self.row_fetches.load(Ordering::SeqCst)
    }

    /// Number of `fetch_count` calls.
    pub fn count_fetches(&self) -> u64 {
        self.count_fetches.load(Ordering::SeqCst)
    }

    /// Number of `execute` calls.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicU64) -> CacheResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(QueryError::ExecutionFailed {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn rows(&self, query: &Query) -> CacheResult<Vec<Value>> {
        let tables = self.tables.read().map_err(|_| QueryError::ExecutionFailed {
            reason: "mock table lock poisoned".to_string(),
        })?;
        Ok(query
            .models
            .iter()
            .filter_map(|model| tables.get(model))
            .flatten()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueryRunner for MockRunner {
    type Row = Value;

    async fn fetch_rows(&self, query: &Query) -> CacheResult<Vec<Value>> {
        self.enter(&self.row_fetches).await?;
        self.rows(query)
    }

    async fn fetch_count(&self, query: &Query) -> CacheResult<u64> {
        self.enter(&self.count_fetches).await?;
        Ok(self.rows(query)?.len() as u64)
    }

    async fn execute(&self, mutation: &Mutation) -> CacheResult<u64> {
        self.enter(&self.executions).await?;
        let mut tables = self.tables.write().map_err(|_| QueryError::ExecutionFailed {
            reason: "mock table lock poisoned".to_string(),
        })?;
        let row = mutation.params.first().cloned().unwrap_or(Value::Null);

        let mut affected = 0u64;
        for model in &mutation.models {
            let table = tables.entry(model.clone()).or_default();
            match mutation.kind {
                MutationKind::Insert => {
                    table.push(row.clone());
                    affected += 1;
                }
                MutationKind::Update => {
                    affected += table.len() as u64;
                    table.iter_mut().for_each(|existing| *existing = row.clone());
                }
                MutationKind::Delete => {
                    affected += table.len() as u64;
                    table.clear();
                }
            }
        }
        Ok(affected)
    }
}
