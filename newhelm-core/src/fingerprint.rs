//! Content-addressed cache keys
//!
//! A [`CacheKey`] is the SHA-256 digest of a domain tag, the canonical
//! encoding of an [`InitializationRecord`] and the canonical encoding of a
//! request, joined by the ASCII record separator `0x1e`. Canonical JSON
//! escapes every control character, so the separator cannot appear inside
//! either part and distinct `(record, request)` pairs never share a preimage.
//!
//! No request fields are filtered here. Callers strip anything
//! non-deterministic (timestamps, request ids) before fingerprinting.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::Result;
use crate::record::InitializationRecord;
use crate::record::canonical;

const DOMAIN_TAG: &[u8] = b"newhelm.fingerprint.v1";
const RECORD_DOMAIN_TAG: &[u8] = b"newhelm.record.v1";
const SEPARATOR: u8 = 0x1e;

/// 32-byte SHA-256 fingerprint
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 lowercase hex characters
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// First eight bytes as an integer, for seeding per-call jitter
    pub fn seed(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }

    /// First two hex characters, used to shard on-disk layouts
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

/// A string that is not 64 hex characters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cache key '{input}': expected 64 hex characters")]
pub struct ParseCacheKeyError {
    input: String,
}

impl FromStr for CacheKey {
    type Err = ParseCacheKeyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ParseCacheKeyError {
            input: s.to_string(),
        };
        if s.len() != 64 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn digest(tag: &[u8], parts: &[&[u8]]) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update([SEPARATOR]);
        hasher.update(part);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    CacheKey(bytes)
}

/// Fingerprint a record together with a serializable request
pub fn fingerprint<R: Serialize + ?Sized>(
    record: &InitializationRecord,
    request: &R,
) -> Result<CacheKey> {
    let request_bytes = canonical::to_canonical_bytes(request)?;
    let record_bytes = record.canonical_bytes()?;
    Ok(digest(DOMAIN_TAG, &[&record_bytes, &request_bytes]))
}

/// Fingerprint a record together with an already-built JSON request
pub fn fingerprint_value(record: &InitializationRecord, request: &Value) -> Result<CacheKey> {
    let request_bytes = canonical::canonical_bytes(request)?;
    let record_bytes = record.canonical_bytes()?;
    Ok(digest(DOMAIN_TAG, &[&record_bytes, &request_bytes]))
}

/// Digest of a record alone, for provenance
pub fn fingerprint_record(record: &InitializationRecord) -> Result<CacheKey> {
    let record_bytes = record.canonical_bytes()?;
    Ok(digest(RECORD_DOMAIN_TAG, &[&record_bytes]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demo_record() -> InitializationRecord {
        InitializationRecord::builder("demo_test")
            .kwarg("dataset", "demo-v1")
            .kwarg("limit", 10)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let request = json!({"prompt": "hello"});
        let a = fingerprint(&demo_record(), &request).unwrap();
        let b = fingerprint(&demo_record(), &request).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert!(a.to_hex().chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[test]
    fn test_request_key_order_does_not_matter() {
        let a = fingerprint_value(&demo_record(), &json!({"prompt": "hi", "n": 1})).unwrap();
        let b = fingerprint_value(&demo_record(), &json!({"n": 1, "prompt": "hi"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sensitive_to_record_and_request() {
        let base = fingerprint(&demo_record(), &json!({"prompt": "hello"})).unwrap();

        let other_request = fingerprint(&demo_record(), &json!({"prompt": "hello!"})).unwrap();
        assert_ne!(base, other_request);

        let other_record = InitializationRecord::builder("demo_test")
            .kwarg("dataset", "demo-v1")
            .kwarg("limit", 11)
            .build()
            .unwrap();
        assert_ne!(base, fingerprint(&other_record, &json!({"prompt": "hello"})).unwrap());
    }

    #[test]
    fn test_record_digest_differs_from_call_key() {
        let record = demo_record();
        let call = fingerprint(&record, &json!(null)).unwrap();
        assert_ne!(call, fingerprint_record(&record).unwrap());
    }

    #[test]
    fn test_typed_and_value_requests_agree() {
        #[derive(Serialize)]
        struct Prompt<'a> {
            prompt: &'a str,
        }
        let typed = fingerprint(&demo_record(), &Prompt { prompt: "hello" }).unwrap();
        let value = fingerprint_value(&demo_record(), &json!({"prompt": "hello"})).unwrap();
        assert_eq!(typed, value);
    }

    #[test]
    fn test_non_finite_request_rejected() {
        #[derive(Serialize)]
        struct Sampling {
            prompt: &'static str,
            temperature: Option<f64>,
        }
        let nan = Sampling {
            prompt: "hello",
            temperature: Some(f64::NAN),
        };
        let absent = Sampling {
            prompt: "hello",
            temperature: None,
        };

        assert!(matches!(
            fingerprint(&demo_record(), &nan),
            Err(crate::error::NewhelmError::Serialization(_))
        ));
        assert!(fingerprint(&demo_record(), &absent).is_ok());
    }

    #[test]
    fn test_hex_round_trip() {
        let key = fingerprint(&demo_record(), &json!({})).unwrap();
        let parsed: CacheKey = key.to_hex().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(key.shard(), key.to_hex()[..2]);

        assert!("abc".parse::<CacheKey>().is_err());
        assert!("zz".repeat(32).parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let key = fingerprint(&demo_record(), &json!({})).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
