//! Fingerprint -> cache lookup -> retried call -> cache store
//!
//! [`CachedCaller`] packages the sequence every SUT or annotator call goes
//! through. Only complete successes are written, so a call abandoned by
//! dropping its future (or failing for good) leaves the cache untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::{PutOutcome, ResponseCache};
use crate::error::Result;
use crate::fingerprint::{CacheKey, fingerprint};
use crate::record::InitializationRecord;
use crate::retry::{CallError, RetryController};

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Fresh,
}

/// A response together with its key and origin
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub key: CacheKey,
    pub value: T,
    pub source: ResponseSource,
}

/// Hit/miss/write counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// Serves calls from the cache and stores fresh responses
pub struct CachedCaller<C: ResponseCache> {
    cache: C,
    retry: RetryController,
    counters: Arc<Counters>,
}

impl<C: ResponseCache> std::fmt::Debug for CachedCaller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCaller")
            .field("retry", &self.retry)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: ResponseCache> CachedCaller<C> {
    pub fn new(cache: C, retry: RetryController) -> Self {
        Self {
            cache,
            retry,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    /// Return the cached response for `(record, request)` or run `operation`
    ///
    /// `operation` runs under the retry controller. A failure to store the
    /// fresh response fails the call.
    pub async fn call<R, F, Fut>(
        &self,
        record: &InitializationRecord,
        request: &R,
        operation: F,
    ) -> Result<CallOutcome<Value>>
    where
        R: Serialize + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Value, CallError>>,
    {
        let key = fingerprint(record, request)?;

        if let Some(value) = self.cache.get(&key)? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, type_identifier = record.type_identifier(), "cache hit");
            return Ok(CallOutcome {
                key,
                value,
                source: ResponseSource::Cache,
            });
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, type_identifier = record.type_identifier(), "cache miss");

        let value = self.retry.call_seeded(key.seed(), operation).await?;

        if self.cache.put(&key, &value)? == PutOutcome::Stored {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(CallOutcome {
            key,
            value,
            source: ResponseSource::Fresh,
        })
    }

    /// Typed variant of [`call`](Self::call)
    pub async fn call_typed<Req, Resp, F, Fut>(
        &self,
        record: &InitializationRecord,
        request: &Req,
        mut operation: F,
    ) -> Result<CallOutcome<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Resp, CallError>>,
    {
        let outcome = self
            .call(record, request, || {
                let attempt = operation();
                async move {
                    let response = attempt.await?;
                    crate::record::canonical::to_canonical_value(&response)
                        .map_err(|e| CallError::new(crate::retry::CallErrorKind::Internal, e.to_string()))
                }
            })
            .await?;

        Ok(CallOutcome {
            key: outcome.key,
            value: serde_json::from_value(outcome.value)?,
            source: outcome.source,
        })
    }
}
