//! # Newhelm - reproducible execution for model evaluations
//!
//! Newhelm is the substrate an evaluation harness runs on. It makes re-running
//! an evaluation cheap and explainable:
//! - Initialization records capture exactly how every SUT, Test and Annotator
//!   was constructed
//! - Fingerprints derived from (record, request) key a write-once response cache
//! - A retry controller absorbs transient provider failures
//! - A dependency manager fetches and verifies the data files tests need
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use newhelm_core::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = NewhelmConfig::load()?;
//!     let caller = CachedCaller::new(config.open_cache()?, RetryController::new(config.retry.clone()));
//!
//!     let sut = InitializationRecord::builder("demo_sut")
//!         .kwarg("model", "tiny")
//!         .build()?;
//!
//!     let outcome = caller
//!         .call(&sut, &json!({"prompt": "hello"}), || async {
//!             Ok(json!({"text": "hi"}))
//!         })
//!         .await?;
//!     println!("{} from {:?}", outcome.value, outcome.source);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **record**: type identifier + constructor arguments, canonical encoding
//! - **fingerprint**: SHA-256 cache keys over canonical (record, request)
//! - **cache**: disk, in-memory and disabled response caches
//! - **retry**: transient/fatal classification and bounded backoff
//! - **deps**: verified, single-flight asset downloads
//! - **registry**: rebuild components from their records
//! - **pipeline**, **provenance**, **secrets**, **config**

pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod provenance;
pub mod record;
pub mod registry;
pub mod retry;
pub mod secrets;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{
        CACHE_SCHEMA_VERSION, CacheEntry, DiskCache, InMemoryCache, NoCache, PutOutcome,
        ResponseCache,
    };
    pub use crate::config::{CacheConfig, ConfigBuilder, DependencyConfig, NewhelmConfig};
    pub use crate::deps::{
        AssetSource, Checksum, Decompression, DependencyAsset, DependencyManager, FetchError,
        HttpSource, LocalFileSource, ResolutionState, SourceRouter,
    };
    pub use crate::error::{NewhelmError, Result};
    pub use crate::fingerprint::{CacheKey, fingerprint, fingerprint_record, fingerprint_value};
    pub use crate::pipeline::{CacheStats, CachedCaller, CallOutcome, ResponseSource};
    pub use crate::provenance::{ComponentProvenance, RunProvenance};
    pub use crate::record::{ArgValue, InitializationRecord, Recorded};
    pub use crate::registry::{Capability, ConstructorArgs, PluginRegistry, RegistryError};
    pub use crate::retry::{
        CallError, CallErrorKind, Classify, ErrorClass, RetryConfig, RetryController, RetryError,
    };
    pub use crate::secrets::{MissingSecretValues, RawSecrets, SecretDescription, SecretRef};
}
