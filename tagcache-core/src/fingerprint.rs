//! Content-derived cache keys.
//!
//! A fingerprint is a SHA-256 digest over a length-prefixed encoding of the
//! cache-use scope, the models a query reads, the query text and its bound
//! parameters. Length prefixes keep `("ab", "c")` and `("a", "bc")` apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// What kind of read a cached result answers.
///
/// A COUNT and a SELECT built from the same query text must never share a
/// key, so the scope is always hashed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FingerprintScope {
    Select,
    Count,
}

impl FingerprintScope {
    /// Stable discriminator used in the digest input and the key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for FingerprintScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deterministic cache key, rendered as `<scope>:<hex sha256>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The key as stored in the cache.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the fingerprint, returning the key.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental builder for a [`Fingerprint`].
///
/// Models are sorted before hashing so the order in which a caller lists
/// the tables a query reads does not change the key. Parameters keep their
/// position: `?1 = a, ?2 = b` is a different query from `?1 = b, ?2 = a`.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    scope: FingerprintScope,
    models: Vec<String>,
    sql: String,
    params: Vec<Value>,
}

impl FingerprintBuilder {
    pub fn new(scope: FingerprintScope, sql: impl Into<String>) -> Self {
        Self {
            scope,
            models: Vec::new(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a model the query reads.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Add several models.
    pub fn models<I, T>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    /// Bind the next positional parameter.
    pub fn param(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }

    /// Bind several positional parameters.
    pub fn params<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.params.extend(values);
        self
    }

    pub fn build(mut self) -> Fingerprint {
        self.models.sort();
        self.models.dedup();

        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.scope.as_str().as_bytes());
        hasher.update((self.models.len() as u64).to_le_bytes());
        for model in &self.models {
            write_field(&mut hasher, model.as_bytes());
        }
        write_field(&mut hasher, self.sql.as_bytes());
        hasher.update((self.params.len() as u64).to_le_bytes());
        for param in &self.params {
            // serde_json's Value maps are BTreeMap-backed without the
            // preserve_order feature, so this rendering is canonical.
            write_field(&mut hasher, param.to_string().as_bytes());
        }

        Fingerprint(format!(
            "{}:{}",
            self.scope.as_str(),
            hex::encode(hasher.finalize())
        ))
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
