//! Error types for newhelm operations

use crate::deps::FetchError;
use crate::fingerprint::CacheKey;
use crate::registry::RegistryError;
use crate::retry::{CallError, RetryError};
use crate::secrets::MissingSecretValues;

/// Result type for newhelm operations
pub type Result<T> = std::result::Result<T, NewhelmError>;

/// Error types surfaced at the core boundary.
///
/// Transient call failures never appear here directly: the retry controller
/// absorbs them and only reports `RetriesExhausted` once its budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum NewhelmError {
    /// A constructor argument has no canonical serialization
    #[error("Unrecordable argument `{argument}` for `{type_identifier}`: {reason}")]
    UnrecordableArgument {
        type_identifier: String,
        argument: String,
        reason: String,
    },

    /// Two different responses were offered for the same fingerprint
    #[error("Cache key conflict for {key}: stored response differs from the new response")]
    CacheKeyConflict { key: CacheKey },

    /// Transient failures persisted past the retry budget
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: CallError,
    },

    /// Outbound call failed with a non-retryable error
    #[error("Call failed: {0}")]
    CallFailed(#[source] CallError),

    /// Downloaded asset bytes do not match the declared checksum
    #[error("Integrity error for asset '{asset}': expected {expected}, got {actual}")]
    IntegrityError {
        asset: String,
        expected: String,
        actual: String,
    },

    /// Asset could not be fetched or materialized
    #[error("Dependency '{asset}' unavailable: {source}")]
    DependencyUnavailable {
        asset: String,
        #[source]
        source: FetchError,
    },

    /// Asset declaration is malformed or contradicts an earlier one
    #[error("Invalid asset '{name}': {reason}")]
    InvalidAsset { name: String, reason: String },

    /// Cache backing store could not complete a durable read or write
    #[error("Cache storage error at {location}: {source}")]
    CacheStorage {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// A persisted cache entry could not be decoded
    #[error("Cache entry {key} is corrupted: {reason}")]
    CacheCorrupted { key: String, reason: String },

    /// Required secrets were not supplied
    #[error(transparent)]
    MissingSecrets(#[from] MissingSecretValues),

    /// Plugin registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NewhelmError {
    pub(crate) fn cache_io(location: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        NewhelmError::CacheStorage {
            location: location.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<RetryError<CallError>> for NewhelmError {
    fn from(err: RetryError<CallError>) -> Self {
        match err {
            RetryError::Fatal { error, .. } => NewhelmError::CallFailed(error),
            RetryError::Exhausted { attempts, last } => {
                NewhelmError::RetriesExhausted { attempts, last }
            }
        }
    }
}
