//! Error types for TAGCACHE operations

use thiserror::Error;

/// Storage layer errors.
///
/// Returned by the key/value store and the tag index. A miss is never an
/// error: these only describe a store that could not answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Write rejected for key {key}: {reason}")]
    WriteRejected { key: String, reason: String },

    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
///
/// Raised only while building a store. They are fatal: nothing retries them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to create cache namespace {namespace}: {reason}")]
    SchemaCreation { namespace: String, reason: String },
}

/// Errors raised by the query runner behind a cached executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Failed to decode query result: {reason}")]
    Decode { reason: String },
}

/// Master error type for all TAGCACHE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

impl CacheError {
    /// True when the error came from the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for TAGCACHE operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
