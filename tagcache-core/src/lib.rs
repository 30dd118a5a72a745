//! TAGCACHE Core - Shared Types
//!
//! Plain data types used by every other crate: the error taxonomy,
//! configuration, cache entries and their envelope, fingerprints, and the
//! query/mutation descriptors. No storage or I/O lives here.

pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod query;

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{CacheConfig, StoreConfig};
pub use entry::{envelope_expires_at_ms, envelope_is_expired, CacheEntry, NEVER_EXPIRES};
pub use error::{CacheError, CacheResult, ConfigError, QueryError, StorageError};
pub use fingerprint::{Fingerprint, FingerprintBuilder, FingerprintScope};
pub use query::{Mutation, MutationKind, Query};
