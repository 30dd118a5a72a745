//! Namespace schema for the LMDB backend.
//!
//! The schema names the databases a namespace is made of. It is supplied by
//! configuration, executed once when the namespace is first created, and
//! stored in the namespace's meta database. Later opens read it back from
//! there, so the stored copy is authoritative.

use serde::{Deserialize, Serialize};
use tagcache_core::constants::SCHEMA_VERSION;
use tagcache_core::ConfigError;

/// Parsed schema definition.
///
/// ```toml
/// version = 1
/// entries = "caches"
/// tags = "caches_tags"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSchema {
    pub version: u32,
    /// Database holding key → entry envelope.
    pub entries: String,
    /// Database holding tag → key list.
    pub tags: String,
}

impl StoreSchema {
    /// Parse and validate a schema definition.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let schema: Self = toml::from_str(source).map_err(|e| invalid(source, e.to_string()))?;
        schema.validate(source)?;
        Ok(schema)
    }

    fn validate(&self, source: &str) -> Result<(), ConfigError> {
        if self.version != SCHEMA_VERSION {
            return Err(invalid(
                source,
                format!(
                    "unsupported schema version {} (expected {SCHEMA_VERSION})",
                    self.version
                ),
            ));
        }
        if self.entries.trim().is_empty() || self.tags.trim().is_empty() {
            return Err(invalid(source, "database names must not be empty".to_string()));
        }
        if self.entries == self.tags {
            return Err(invalid(
                source,
                "entries and tags must use different databases".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(source: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: "storage.schema".to_string(),
        value: source.to_string(),
        reason,
    }
}
