//! Process-local caches

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{CACHE_SCHEMA_VERSION, PutOutcome, ResponseCache};
use crate::error::{NewhelmError, Result};
use crate::fingerprint::CacheKey;
use crate::record::canonical;

/// In-memory cache with the same write-once semantics as [`super::DiskCache`]
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<CacheKey, Value>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut entries) => entries.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl ResponseCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<PutOutcome> {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some(existing) if canonical::canonical_eq(existing, value)? => {
                Ok(PutOutcome::AlreadyPresent)
            }
            Some(_) => Err(NewhelmError::CacheKeyConflict { key: *key }),
            None => {
                entries.insert(*key, value.clone());
                Ok(PutOutcome::Stored)
            }
        }
    }
}

/// Cache that never stores anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ResponseCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Value>> {
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _value: &Value) -> Result<PutOutcome> {
        Ok(PutOutcome::Discarded)
    }

    fn schema_version(&self) -> u32 {
        CACHE_SCHEMA_VERSION
    }
}
