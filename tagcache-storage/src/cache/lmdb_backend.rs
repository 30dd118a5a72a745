//! LMDB-backed store and tag index.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep cache entries and
//! the tag index in one memory-mapped environment.
//!
//! # Layout
//!
//! A namespace is three named databases:
//! - `<schema.entries>`: key → entry envelope (expiry prefix, JSON header, value)
//! - `<schema.tags>`: tag → JSON array of keys
//! - `<namespace>.meta`: the schema text that created the namespace
//!
//! The namespace exists when the meta database holds a schema record. On
//! first open the configured schema is required and is executed in a single
//! write transaction together with the meta record, so a crash leaves either
//! no namespace or a complete one.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get`, `keys_for` and scans
//! - Write transactions for every mutation; LMDB serializes writers, so each
//!   tag read-modify-write is atomic

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use tagcache_core::constants::{META_DB_SUFFIX, META_SCHEMA_KEY};
use tagcache_core::{
    envelope_is_expired, CacheEntry, CacheError, CacheResult, ConfigError, StorageError,
    StoreConfig, Timestamp,
};

use super::schema::StoreSchema;
use super::traits::{CacheStore, TagIndex};

/// Largest key LMDB accepts with its default build options.
pub const MAX_KEY_LEN: usize = 511;

/// Named databases per environment: up to two namespaces of three databases.
const MAX_DBS: u32 = 6;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Missing or invalid configuration, including schema problems.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbCacheError to CacheError.
impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Config(config) => CacheError::Config(config),
            LmdbCacheError::EnvOpen(reason) | LmdbCacheError::Transaction(reason) => {
                CacheError::Storage(StorageError::Unavailable { reason })
            }
            LmdbCacheError::Io(io) => CacheError::Storage(StorageError::Unavailable {
                reason: io.to_string(),
            }),
        }
    }
}

fn txn_error(e: heed::Error) -> StorageError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
}

fn check_key(kind: &str, key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StorageError::WriteRejected {
            key: key.to_string(),
            reason: format!("{kind} must be 1..={MAX_KEY_LEN} bytes, got {}", key.len()),
        });
    }
    Ok(())
}

/// An opened LMDB environment holding one cache namespace.
///
/// # Example
///
/// ```ignore
/// use tagcache_core::CacheConfig;
/// use tagcache_storage::cache::{LmdbBackend, TaggedCache};
///
/// let config = CacheConfig::new()
///     .with_path("/var/cache/app")
///     .with_schema(CacheConfig::default_schema());
/// let backend = LmdbBackend::open(&config.storage)?;
/// let cache = TaggedCache::new(Arc::new(backend.store()), Arc::new(backend.tag_index()), config);
/// ```
pub struct LmdbBackend {
    env: Env,
    namespace: String,
    schema: StoreSchema,
    entries: Database<Str, Bytes>,
    tags: Database<Str, Bytes>,
}

impl LmdbBackend {
    /// Open the environment at `config.path`, creating the namespace from
    /// `config.schema` if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - `path` is not set
    /// - the namespace is missing and no schema was supplied
    /// - the schema is invalid or could not be executed
    ///
    /// Returns an environment error if LMDB cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self, LmdbCacheError> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "storage.path".to_string(),
            })?;
        if config.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.namespace".to_string(),
                value: config.namespace.clone(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        let env = Self::open_env(path, config.map_size_mb)?;
        let meta_name = format!("{}{}", config.namespace, META_DB_SUFFIX);

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let stored_schema = Self::read_stored_schema(&env, &wtxn, &meta_name)?;

        let (schema, entries, tags) = match stored_schema {
            Some(text) => {
                let schema = StoreSchema::parse(&text)?;
                let open = |name: &str| -> Result<Database<Str, Bytes>, LmdbCacheError> {
                    env.open_database(&wtxn, Some(name))
                        .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
                        .ok_or_else(|| {
                            ConfigError::SchemaCreation {
                                namespace: config.namespace.clone(),
                                reason: format!("database {name} declared by stored schema is missing"),
                            }
                            .into()
                        })
                };
                let entries = open(&schema.entries)?;
                let tags = open(&schema.tags)?;
                (schema, entries, tags)
            }
            None => {
                let text = config
                    .schema
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingRequired {
                        field: "storage.schema".to_string(),
                    })?;
                let schema = StoreSchema::parse(text)?;
                let creation = |e: heed::Error| ConfigError::SchemaCreation {
                    namespace: config.namespace.clone(),
                    reason: e.to_string(),
                };

                let meta: Database<Str, Str> = env
                    .create_database(&mut wtxn, Some(&meta_name))
                    .map_err(creation)?;
                let entries: Database<Str, Bytes> = env
                    .create_database(&mut wtxn, Some(&schema.entries))
                    .map_err(creation)?;
                let tags: Database<Str, Bytes> = env
                    .create_database(&mut wtxn, Some(&schema.tags))
                    .map_err(creation)?;
                meta.put(&mut wtxn, META_SCHEMA_KEY, text).map_err(creation)?;

                tracing::info!(
                    namespace = %config.namespace,
                    entries = %schema.entries,
                    tags = %schema.tags,
                    "Created cache namespace"
                );
                (schema, entries, tags)
            }
        };

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            namespace: config.namespace.clone(),
            schema,
            entries,
            tags,
        })
    }

    fn open_env(path: &Path, map_size_mb: usize) -> Result<Env, LmdbCacheError> {
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment is only opened through this constructor and
        // callers are expected not to open the same directory twice in one
        // process.
        unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(MAX_DBS)
                .open(path)
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))
    }

    fn read_stored_schema(
        env: &Env,
        txn: &RoTxn,
        meta_name: &str,
    ) -> Result<Option<String>, LmdbCacheError> {
        let meta: Option<Database<Str, Str>> = env
            .open_database(txn, Some(meta_name))
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        let text = meta
            .get(txn, META_SCHEMA_KEY)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(text.map(str::to_string))
    }

    /// Name of the opened namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Schema the namespace was created with.
    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Entry store handle sharing this environment.
    pub fn store(&self) -> LmdbStore {
        LmdbStore {
            env: self.env.clone(),
            entries: self.entries,
        }
    }

    /// Tag index handle sharing this environment.
    pub fn tag_index(&self) -> LmdbTagIndex {
        LmdbTagIndex {
            env: self.env.clone(),
            tags: self.tags,
        }
    }
}

/// LMDB entry store.
#[derive(Clone)]
pub struct LmdbStore {
    env: Env,
    entries: Database<Str, Bytes>,
}

impl LmdbStore {
    fn get_live(&self, key: &str, now: Timestamp) -> Result<Option<CacheEntry>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        match self.entries.get(&rtxn, key).map_err(txn_error)? {
            Some(bytes) if !envelope_is_expired(bytes, now) => {
                Ok(Some(CacheEntry::decode(key, bytes)?))
            }
            _ => Ok(None),
        }
    }

    fn put_entry(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        check_key("key", &entry.key)?;
        let bytes = entry.encode()?;

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.entries
            .put(&mut wtxn, &entry.key, &bytes)
            .map_err(|e| StorageError::WriteRejected {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_error)
    }

    /// Remove `key`, or only when it is expired at `expired_at` if given.
    fn remove_entry(
        &self,
        key: &str,
        expired_at: Option<Timestamp>,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let removed = match self.entries.get(&wtxn, key).map_err(txn_error)? {
            Some(bytes) => {
                if expired_at.is_some_and(|now| !envelope_is_expired(bytes, now)) {
                    return Ok(None);
                }
                match CacheEntry::decode(key, bytes) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Removing undecodable cache entry");
                        // Its tags are unreadable; the reverse sweep detaches them.
                        Some(CacheEntry::new(key, Vec::new(), None))
                    }
                }
            }
            None => return Ok(None),
        };
        self.entries.delete(&mut wtxn, key).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(removed)
    }

    fn collect_expired(&self, now: Timestamp) -> Result<Vec<String>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut expired = Vec::new();
        for result in self.entries.iter(&rtxn).map_err(txn_error)? {
            let (key, bytes) = result.map_err(txn_error)?;
            if envelope_is_expired(bytes, now) {
                expired.push(key.to_string());
            }
        }
        Ok(expired)
    }

    fn count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.entries.len(&rtxn).map_err(txn_error)
    }

    fn clear_all(&self) -> Result<u64, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let removed = self.entries.len(&wtxn).map_err(txn_error)?;
        self.entries.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for LmdbStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(self.get_live(key, Utc::now())?)
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        Ok(self.put_entry(entry)?)
    }

    async fn remove(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(self.remove_entry(key, None)?)
    }

    async fn remove_expired(&self, key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>> {
        Ok(self.remove_entry(key, Some(now))?)
    }

    async fn scan_expired(&self, now: Timestamp) -> CacheResult<Vec<String>> {
        Ok(self.collect_expired(now)?)
    }

    async fn len(&self) -> CacheResult<u64> {
        Ok(self.count()?)
    }

    async fn clear(&self) -> CacheResult<u64> {
        Ok(self.clear_all()?)
    }
}

/// LMDB tag index. Each tag maps to a sorted JSON array of keys.
#[derive(Clone)]
pub struct LmdbTagIndex {
    env: Env,
    tags: Database<Str, Bytes>,
}

impl LmdbTagIndex {
    fn decode_keys(tag: &str, bytes: &[u8]) -> Result<BTreeSet<String>, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::CorruptEntry {
            key: tag.to_string(),
            reason: format!("invalid tag key list: {e}"),
        })
    }

    fn encode_keys(keys: &BTreeSet<String>) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(keys).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })
    }

    fn read_keys(&self, txn: &RoTxn, tag: &str) -> Result<BTreeSet<String>, StorageError> {
        match self.tags.get(txn, tag).map_err(txn_error)? {
            Some(bytes) => Self::decode_keys(tag, bytes),
            None => Ok(BTreeSet::new()),
        }
    }

    fn attach_key(&self, tag: &str, key: &str) -> Result<(), StorageError> {
        check_key("tag", tag)?;
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut keys = self.read_keys(&wtxn, tag)?;
        if keys.insert(key.to_string()) {
            let bytes = Self::encode_keys(&keys)?;
            self.tags
                .put(&mut wtxn, tag, &bytes)
                .map_err(|e| StorageError::WriteRejected {
                    key: tag.to_string(),
                    reason: e.to_string(),
                })?;
            wtxn.commit().map_err(txn_error)?;
        }
        Ok(())
    }

    fn keys(&self, tag: &str) -> Result<BTreeSet<String>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.read_keys(&rtxn, tag)
    }

    fn take_all(&self, tag: &str) -> Result<BTreeSet<String>, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let keys = self.read_keys(&wtxn, tag)?;
        if self.tags.delete(&mut wtxn, tag).map_err(txn_error)? {
            wtxn.commit().map_err(txn_error)?;
        }
        Ok(keys)
    }

    fn detach_key(&self, tag: &str, key: &str) -> Result<bool, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut keys = self.read_keys(&wtxn, tag)?;
        if !keys.remove(key) {
            return Ok(false);
        }
        if keys.is_empty() {
            self.tags.delete(&mut wtxn, tag).map_err(txn_error)?;
        } else {
            let bytes = Self::encode_keys(&keys)?;
            self.tags.put(&mut wtxn, tag, &bytes).map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(true)
    }

    fn all_tags(&self) -> Result<Vec<String>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut tags = Vec::new();
        for result in self.tags.iter(&rtxn).map_err(txn_error)? {
            let (tag, _) = result.map_err(txn_error)?;
            tags.push(tag.to_string());
        }
        Ok(tags)
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.tags.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }
}

#[async_trait]
impl TagIndex for LmdbTagIndex {
    async fn attach(&self, tag: &str, key: &str) -> CacheResult<()> {
        Ok(self.attach_key(tag, key)?)
    }

    async fn keys_for(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        Ok(self.keys(tag)?)
    }

    async fn detach_all(&self, tag: &str) -> CacheResult<BTreeSet<String>> {
        Ok(self.take_all(tag)?)
    }

    async fn detach(&self, tag: &str, key: &str) -> CacheResult<bool> {
        Ok(self.detach_key(tag, key)?)
    }

    async fn tags(&self) -> CacheResult<Vec<String>> {
        Ok(self.all_tags()?)
    }

    async fn clear(&self) -> CacheResult<()> {
        Ok(self.clear_all()?)
    }
}
