//! Configuration types

use crate::constants::{
    DEFAULT_GC_PROBABILITY_PERCENT, DEFAULT_MAP_SIZE_MB, DEFAULT_NAMESPACE, DEFAULT_SCHEMA,
    DEFAULT_TTL_SECS, ENV_PREFIX,
};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where and how the persistent store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the LMDB environment. Required by the LMDB store.
    pub path: Option<PathBuf>,
    /// Name of the namespace whose meta record marks the store as initialized.
    pub namespace: String,
    /// Schema definition (TOML) executed once when the namespace is missing.
    pub schema: Option<String>,
    /// Maximum size of the memory map in megabytes.
    pub map_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            schema: None,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

/// Master configuration for a tagged cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub storage: StoreConfig,
    /// Lifetime applied when a write passes no TTL. `None` keeps entries
    /// until they are invalidated.
    pub default_ttl_secs: Option<u64>,
    /// Chance, in percent, that a cache-consuming call triggers a sweep.
    pub gc_probability_percent: u8,
    /// Run triggered sweeps on a background task instead of inline.
    pub gc_in_background: bool,
    /// When false, executors read through to the runner without caching.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage: StoreConfig::default(),
            default_ttl_secs: Some(DEFAULT_TTL_SECS),
            gc_probability_percent: DEFAULT_GC_PROBABILITY_PERCENT,
            gc_in_background: false,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock schema definition for a fresh namespace.
    pub fn default_schema() -> &'static str {
        DEFAULT_SCHEMA
    }

    /// Set the storage directory.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = Some(path.into());
        self
    }

    /// Set the namespace name.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.storage.namespace = namespace.into();
        self
    }

    /// Set the schema definition used at first initialization.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.storage.schema = Some(schema.into());
        self
    }

    /// Set the LMDB map size.
    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.storage.map_size_mb = map_size_mb;
        self
    }

    /// Set the default TTL; `None` disables expiry for untimed writes.
    ///
    /// Fractional seconds round up, so a sub-second TTL becomes one second
    /// rather than zero.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl_secs = ttl.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0));
        self
    }

    /// Set the GC trigger probability in percent.
    pub fn with_gc_probability_percent(mut self, percent: u8) -> Self {
        self.gc_probability_percent = percent;
        self
    }

    /// Choose between inline and background sweeps.
    pub fn with_gc_in_background(mut self, background: bool) -> Self {
        self.gc_in_background = background;
        self
    }

    /// Enable or disable caching of reads.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Default TTL as a duration.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// GC trigger probability as a fraction in `[0, 1]`.
    pub fn gc_probability(&self) -> f64 {
        f64::from(self.gc_probability_percent.min(100)) / 100.0
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_probability_percent > 100 {
            return Err(ConfigError::InvalidValue {
                field: "gc_probability_percent".to_string(),
                value: self.gc_probability_percent.to_string(),
                reason: "must be between 0 and 100".to_string(),
            });
        }
        if self.storage.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.namespace".to_string(),
                value: self.storage.namespace.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.storage.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
            field: "config".to_string(),
            value: "<toml>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TAGCACHE_STORAGE_PATH`: LMDB directory (no default)
    /// - `TAGCACHE_STORAGE_NAMESPACE`: namespace name (default: caches)
    /// - `TAGCACHE_STORAGE_SCHEMA`: schema definition text (no default)
    /// - `TAGCACHE_STORAGE_MAP_SIZE_MB`: map size (default: 64)
    /// - `TAGCACHE_DEFAULT_TTL_SECS`: default TTL, or `none` (default: 3600)
    /// - `TAGCACHE_GC_PROBABILITY`: sweep chance in percent (default: 15)
    /// - `TAGCACHE_GC_IN_BACKGROUND`: run sweeps on a task (default: false)
    /// - `TAGCACHE_ENABLED`: cache reads at all (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    ///
    /// Unparseable values are rejected rather than replaced by defaults so a
    /// typo in deployment config fails loudly.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };
        let mut config = Self::default();

        if let Some((_, path)) = var("STORAGE_PATH") {
            config.storage.path = Some(PathBuf::from(path));
        }
        if let Some((_, namespace)) = var("STORAGE_NAMESPACE") {
            config.storage.namespace = namespace;
        }
        if let Some((_, schema)) = var("STORAGE_SCHEMA") {
            config.storage.schema = Some(schema);
        }
        if let Some((name, raw)) = var("STORAGE_MAP_SIZE_MB") {
            config.storage.map_size_mb = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("DEFAULT_TTL_SECS") {
            config.default_ttl_secs = if raw.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_env(&name, &raw)?)
            };
        }
        if let Some((name, raw)) = var("GC_PROBABILITY") {
            config.gc_probability_percent = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("GC_IN_BACKGROUND") {
            config.gc_in_background = parse_bool(&name, &raw)?;
        }
        if let Some((name, raw)) = var("ENABLED") {
            config.enabled = parse_bool(&name, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: name.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
