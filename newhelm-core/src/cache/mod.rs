//! Persistent response cache keyed by fingerprint
//!
//! A key is written at most once. Re-writing an identical value succeeds
//! without touching the store; offering a different value for an existing
//! key fails with [`NewhelmError::CacheKeyConflict`](crate::error::NewhelmError)
//! and leaves the stored entry untouched. Entries are never mutated in place
//! and disappear only through explicit maintenance (`clear`, version prune).
//!
//! # Implementations
//!
//! - [`DiskCache`]: one JSON file per entry under `v<schema>/<aa>/<hex>.json`,
//!   written with temp file + fsync + no-clobber link + directory fsync
//! - [`InMemoryCache`]: process-local map with the same write-once semantics
//! - [`NoCache`]: every lookup misses, every write is accepted and dropped

mod disk;
mod memory;

#[cfg(test)]
mod tests;

pub use disk::{DiskCache, DiskCacheStats};
pub use memory::{InMemoryCache, NoCache};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::fingerprint::CacheKey;

/// Current on-disk entry schema
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Result of a successful `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    /// The value was durably written by this call
    Stored,
    /// An identical value was already present
    AlreadyPresent,
    /// The cache keeps nothing; the value was dropped
    Discarded,
}

/// Metadata stored with every entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// A persisted cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: Value, schema_version: u32) -> Self {
        Self {
            key,
            value,
            metadata: EntryMetadata {
                created_at: Utc::now(),
                schema_version,
            },
        }
    }
}

/// Fingerprint -> response store
///
/// Implementations must be safe to share between threads. Concurrent calls
/// for the same key settle as: first durable write wins, equal later writes
/// return [`PutOutcome::AlreadyPresent`], different later writes conflict.
pub trait ResponseCache: Send + Sync {
    /// Look up a stored response
    fn get(&self, key: &CacheKey) -> Result<Option<Value>>;

    /// Store a response. Durable before returning `Ok`.
    fn put(&self, key: &CacheKey, value: &Value) -> Result<PutOutcome>;

    /// Schema version namespace this cache reads and writes
    fn schema_version(&self) -> u32 {
        CACHE_SCHEMA_VERSION
    }
}

impl<C: ResponseCache + ?Sized> ResponseCache for std::sync::Arc<C> {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        (**self).get(key)
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<PutOutcome> {
        (**self).put(key, value)
    }

    fn schema_version(&self) -> u32 {
        (**self).schema_version()
    }
}
