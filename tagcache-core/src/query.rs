//! Descriptors for the reads and writes a cached executor handles.
//!
//! These carry just enough identity to fingerprint a read and to know which
//! tags a write invalidates. Building the SQL is the caller's business.

use crate::fingerprint::{Fingerprint, FingerprintBuilder, FingerprintScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A read against one or more models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Models the query reads; each becomes an invalidation tag.
    pub models: BTreeSet<String>,
    pub sql: String,
    pub params: Vec<Value>,
}

impl Query {
    /// Create a query reading `model`.
    pub fn new(model: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut models = BTreeSet::new();
        models.insert(model.into());
        Self {
            models,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Record that the query also reads `model` (a join, a subquery).
    pub fn reads(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    /// Cache key for this query in the given scope.
    pub fn fingerprint(&self, scope: FingerprintScope) -> Fingerprint {
        FingerprintBuilder::new(scope, self.sql.as_str())
            .models(self.models.iter().cloned())
            .params(self.params.iter().cloned())
            .build()
    }

    /// Tags a cached result of this query is filed under.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }
}

/// Kind of mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// A write that invalidates every cached read of the models it touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub models: BTreeSet<String>,
    pub sql: String,
    pub params: Vec<Value>,
}

impl Mutation {
    pub fn new(kind: MutationKind, model: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut models = BTreeSet::new();
        models.insert(model.into());
        Self {
            kind,
            models,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn insert(model: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(MutationKind::Insert, model, sql)
    }

    pub fn update(model: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(MutationKind::Update, model, sql)
    }

    pub fn delete(model: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(MutationKind::Delete, model, sql)
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Record that the statement also changes `model` (cascades, triggers).
    pub fn touches(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tags_are_models() {
        let query = Query::new("Post", "SELECT * FROM posts JOIN authors")
            .reads("Author")
            .bind(5);
        let tags: Vec<&str> = query.tags().collect();
        assert_eq!(tags, vec!["Author", "Post"]);
        assert_eq!(query.params.len(), 1);
    }

    #[test]
    fn test_query_fingerprint_uses_params() {
        let a = Query::new("Post", "SELECT * FROM posts WHERE id = ?").bind(1);
        let b = Query::new("Post", "SELECT * FROM posts WHERE id = ?").bind(2);
        assert_ne!(
            a.fingerprint(FingerprintScope::Select),
            b.fingerprint(FingerprintScope::Select)
        );
        assert_eq!(
            a.fingerprint(FingerprintScope::Select),
            a.clone().fingerprint(FingerprintScope::Select)
        );
    }

    #[test]
    fn test_query_fingerprint_scope() {
        let query = Query::new("Post", "SELECT * FROM posts");
        assert_ne!(
            query.fingerprint(FingerprintScope::Select),
            query.fingerprint(FingerprintScope::Count)
        );
    }

    #[test]
    fn test_mutation_constructors() {
        let m = Mutation::update("Post", "UPDATE posts SET title = ?")
            .bind("new")
            .touches("Comment");
        assert_eq!(m.kind, MutationKind::Update);
        assert!(m.models.contains("Post"));
        assert!(m.models.contains("Comment"));

        assert_eq!(Mutation::insert("Post", "INSERT").kind, MutationKind::Insert);
        assert_eq!(Mutation::delete("Post", "DELETE").kind, MutationKind::Delete);
    }
}
