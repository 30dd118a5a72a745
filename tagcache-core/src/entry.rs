//! Cache entries and their persisted envelope.
//!
//! An entry is stored as a single byte blob so a store can write it
//! atomically:
//!
//! ```text
//! [expires_at: i64 LE millis, i64::MAX = never][header_len: u32 LE][header JSON][value]
//! ```
//!
//! The expiry comes first so a sweep can classify an entry from its first
//! eight bytes without decoding the rest.

use crate::error::StorageError;
use crate::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Sentinel expiry for entries without a TTL.
pub const NEVER_EXPIRES: i64 = i64::MAX;

const EXPIRY_LEN: usize = 8;
const HEADER_LEN_LEN: usize = 4;
const PREFIX_LEN: usize = EXPIRY_LEN + HEADER_LEN_LEN;

/// A cached value with its tags and lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub tags: BTreeSet<String>,
    pub created_at: Timestamp,
    pub ttl: Option<Duration>,
}

/// JSON header carried between the fixed prefix and the value.
#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    created_at_ms: i64,
    ttl_ms: Option<u64>,
    tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tags: BTreeSet::new(),
            created_at: Utc::now(),
            ttl,
        }
    }

    /// Attach tags to the entry.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// When the entry stops being served, or `None` if it never expires.
    pub fn expires_at(&self) -> Option<Timestamp> {
        let ttl = self.ttl?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    /// An entry is expired once `now` reaches its expiry. A zero TTL is
    /// therefore expired immediately.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Shorthand for `is_expired_at(Utc::now())`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Encode the entry into its persisted envelope.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let header = EntryHeader {
            created_at_ms: self.created_at.timestamp_millis(),
            ttl_ms: self.ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            tags: self.tags.clone(),
        };
        let header_bytes = serde_json::to_vec(&header).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        let header_len = u32::try_from(header_bytes.len()).map_err(|_| {
            StorageError::WriteRejected {
                key: self.key.clone(),
                reason: "tag header too large".to_string(),
            }
        })?;

        let expires_ms = self
            .expires_at()
            .map(|at| at.timestamp_millis())
            .unwrap_or(NEVER_EXPIRES);

        let mut bytes = Vec::with_capacity(PREFIX_LEN + header_bytes.len() + self.value.len());
        bytes.extend_from_slice(&expires_ms.to_le_bytes());
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&header_bytes);
        bytes.extend_from_slice(&self.value);
        Ok(bytes)
    }

    /// Decode an envelope read back from storage under `key`.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        let corrupt = |reason: &str| StorageError::CorruptEntry {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if bytes.len() < PREFIX_LEN {
            return Err(corrupt("envelope shorter than fixed prefix"));
        }
        let header_len_bytes: [u8; HEADER_LEN_LEN] = bytes[EXPIRY_LEN..PREFIX_LEN]
            .try_into()
            .map_err(|_| corrupt("invalid header length"))?;
        let header_len = u32::from_le_bytes(header_len_bytes) as usize;
        let header_end = PREFIX_LEN
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupt("header runs past end of envelope"))?;

        let header: EntryHeader = serde_json::from_slice(&bytes[PREFIX_LEN..header_end])
            .map_err(|e| corrupt(&format!("invalid header: {e}")))?;
        let created_at = DateTime::from_timestamp_millis(header.created_at_ms)
            .ok_or_else(|| corrupt("creation timestamp out of range"))?;

        Ok(Self {
            key: key.to_string(),
            value: bytes[header_end..].to_vec(),
            tags: header.tags,
            created_at,
            ttl: header.ttl_ms.map(Duration::from_millis),
        })
    }
}

/// Read the expiry prefix of an envelope without decoding the header.
///
/// Returns `None` for envelopes too short to carry one.
pub fn envelope_expires_at_ms(bytes: &[u8]) -> Option<i64> {
    let prefix: [u8; EXPIRY_LEN] = bytes.get(..EXPIRY_LEN)?.try_into().ok()?;
    Some(i64::from_le_bytes(prefix))
}

/// True when an envelope's expiry prefix is at or before `now`.
pub fn envelope_is_expired(bytes: &[u8], now: Timestamp) -> bool {
    match envelope_expires_at_ms(bytes) {
        Some(NEVER_EXPIRES) => false,
        Some(expires_ms) => expires_ms <= now.timestamp_millis(),
        None => false,
    }
}
