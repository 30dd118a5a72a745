//! Constants for TAGCACHE
//!
//! Defaults and fixed names shared by the configuration layer and the
//! storage backends.

// ============================================================================
// EXPIRY
// ============================================================================

/// Default entry lifetime in seconds (1 hour)
pub const DEFAULT_TTL_SECS: u64 = 3600;

// ============================================================================
// GARBAGE COLLECTION
// ============================================================================

/// Default chance, in percent, that a cache-consuming call triggers a sweep
pub const DEFAULT_GC_PROBABILITY_PERCENT: u8 = 15;

// ============================================================================
// STORAGE
// ============================================================================

/// Default namespace name for the cache databases
pub const DEFAULT_NAMESPACE: &str = "caches";

/// Default LMDB map size in megabytes
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Schema version understood by this release
pub const SCHEMA_VERSION: u32 = 1;

/// Suffix of the database recording which schema created a namespace
pub const META_DB_SUFFIX: &str = ".meta";

/// Key under which the schema text is stored in the meta database
pub const META_SCHEMA_KEY: &str = "schema";

/// Schema definition used when a caller asks for the stock layout
pub const DEFAULT_SCHEMA: &str = r#"version = 1
entries = "caches"
tags = "caches_tags"
"#;

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Prefix shared by every environment variable read by `CacheConfig::from_env`
pub const ENV_PREFIX: &str = "TAGCACHE_";
