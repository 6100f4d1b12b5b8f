//! Initialization records for pluggable components
//!
//! An [`InitializationRecord`] captures the stable type identifier and the
//! exact constructor arguments used to build a SUT, Test or Annotator. The
//! same data backs three things:
//! - the cache fingerprint (see [`crate::fingerprint`])
//! - human-readable provenance for a run
//! - a recipe to rebuild an equivalent object through the plugin registry
//!
//! # Example
//!
//! ```rust
//! use newhelm_core::record::InitializationRecord;
//!
//! let record = InitializationRecord::builder("bbq")
//!     .kwarg("subject", "all")
//!     .kwarg("num_in_context_examples", 5)
//!     .build()?;
//!
//! assert_eq!(record.to_string(), r#"bbq(num_in_context_examples=5, subject="all")"#);
//! # Ok::<(), newhelm_core::error::NewhelmError>(())
//! ```

pub mod canonical;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{NewhelmError, Result};
use crate::secrets::SecretRef;

/// A single recorded constructor argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    /// Plain data built from primitives, sequences and string-keyed maps
    Value(Value),
    /// Reference to a secret; the value itself is never recorded
    Secret(SecretRef),
}

impl ArgValue {
    /// Capture any serializable value.
    ///
    /// Fails when the value's `Serialize` impl errors or produces a shape
    /// JSON cannot express (a map with non-string keys, a NaN or infinite
    /// float anywhere inside it).
    pub fn from_serialize<T: Serialize>(value: T) -> std::result::Result<Self, String> {
        canonical::to_canonical_value(&value)
            .map(ArgValue::Value)
            .map_err(|e| e.to_string())
    }

    /// Capture a float, rejecting NaN and infinities
    pub fn float(value: f64) -> std::result::Result<Self, String> {
        Number::from_f64(value)
            .map(|n| ArgValue::Value(Value::Number(n)))
            .ok_or_else(|| format!("non-finite float {} has no canonical form", value))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ArgValue::Value(v) => Some(v),
            ArgValue::Secret(_) => None,
        }
    }

    pub fn as_secret(&self) -> Option<&SecretRef> {
        match self {
            ArgValue::Secret(s) => Some(s),
            ArgValue::Value(_) => None,
        }
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        ArgValue::Value(value)
    }
}

impl From<SecretRef> for ArgValue {
    fn from(secret: SecretRef) -> Self {
        ArgValue::Secret(secret)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Value(v) => write!(f, "{}", canonical::canonicalize(v)),
            ArgValue::Secret(s) => write!(f, "{}", s),
        }
    }
}

/// Class identity and constructor arguments of a pluggable object.
///
/// Immutable once built. Keyword arguments are held sorted by name, so two
/// records built with the same arguments in a different order compare equal
/// and fingerprint identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializationRecord {
    type_identifier: String,
    #[serde(default)]
    positional_args: Vec<ArgValue>,
    #[serde(default)]
    keyword_args: BTreeMap<String, ArgValue>,
}

impl InitializationRecord {
    /// Start recording a constructor call for `type_identifier`
    pub fn builder(type_identifier: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(type_identifier)
    }

    /// Record with no constructor arguments
    pub fn bare(type_identifier: impl Into<String>) -> Result<Self> {
        Self::builder(type_identifier).build()
    }

    pub fn type_identifier(&self) -> &str {
        &self.type_identifier
    }

    pub fn positional_args(&self) -> &[ArgValue] {
        &self.positional_args
    }

    pub fn keyword_args(&self) -> &BTreeMap<String, ArgValue> {
        &self.keyword_args
    }

    pub fn keyword(&self, name: &str) -> Option<&ArgValue> {
        self.keyword_args.get(name)
    }

    /// All secret references in argument order
    pub fn secret_refs(&self) -> impl Iterator<Item = &SecretRef> {
        self.positional_args
            .iter()
            .chain(self.keyword_args.values())
            .filter_map(ArgValue::as_secret)
    }

    /// Canonical byte encoding used for fingerprinting
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonical::to_canonical_bytes(self)?)
    }

    /// Serialize for persistence or transfer
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a record from [`to_json`](Self::to_json) output
    pub fn from_json(json: &str) -> Result<Self> {
        let record: InitializationRecord = serde_json::from_str(json)?;
        if record.type_identifier.is_empty() {
            return Err(NewhelmError::UnrecordableArgument {
                type_identifier: String::new(),
                argument: "type_identifier".to_string(),
                reason: "type identifier must not be empty".to_string(),
            });
        }
        Ok(record)
    }

    /// Borrowed view of the call that rebuilds an equivalent object
    pub fn constructor_call(&self) -> ConstructorCall<'_> {
        ConstructorCall {
            type_identifier: &self.type_identifier,
            args: &self.positional_args,
            kwargs: &self.keyword_args,
        }
    }

    /// Decompose into (type_identifier, args, kwargs)
    pub fn into_parts(self) -> (String, Vec<ArgValue>, BTreeMap<String, ArgValue>) {
        (self.type_identifier, self.positional_args, self.keyword_args)
    }
}

impl fmt::Display for InitializationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_identifier)?;
        let mut first = true;
        for arg in &self.positional_args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
            first = false;
        }
        for (name, arg) in &self.keyword_args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, arg)?;
            first = false;
        }
        write!(f, ")")
    }
}

/// Constructor call derived from a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstructorCall<'a> {
    pub type_identifier: &'a str,
    pub args: &'a [ArgValue],
    pub kwargs: &'a BTreeMap<String, ArgValue>,
}

/// Builder for [`InitializationRecord`].
///
/// The first unrecordable argument is remembered and reported by
/// [`build`](Self::build), so calls can be chained freely.
#[derive(Debug)]
pub struct RecordBuilder {
    type_identifier: String,
    positional_args: Vec<ArgValue>,
    keyword_args: BTreeMap<String, ArgValue>,
    error: Option<NewhelmError>,
}

impl RecordBuilder {
    fn new(type_identifier: impl Into<String>) -> Self {
        Self {
            type_identifier: type_identifier.into(),
            positional_args: Vec::new(),
            keyword_args: BTreeMap::new(),
            error: None,
        }
    }

    fn fail(&mut self, argument: String, reason: String) {
        if self.error.is_none() {
            self.error = Some(NewhelmError::UnrecordableArgument {
                type_identifier: self.type_identifier.clone(),
                argument,
                reason,
            });
        }
    }

    /// Append a positional argument
    pub fn arg<T: Serialize>(self, value: T) -> Self {
        let captured = ArgValue::from_serialize(value);
        self.arg_result(captured)
    }

    /// Append a positional argument that is already an [`ArgValue`]
    pub fn arg_value(mut self, value: ArgValue) -> Self {
        self.positional_args.push(value);
        self
    }

    /// Append a positional float, rejecting NaN and infinities
    pub fn float_arg(self, value: f64) -> Self {
        let captured = ArgValue::float(value);
        self.arg_result(captured)
    }

    /// Append a positional secret reference
    pub fn secret_arg(self, secret: SecretRef) -> Self {
        self.arg_value(ArgValue::Secret(secret))
    }

    fn arg_result(mut self, captured: std::result::Result<ArgValue, String>) -> Self {
        let position = self.positional_args.len();
        match captured {
            Ok(value) => self.positional_args.push(value),
            Err(reason) => self.fail(format!("#{}", position), reason),
        }
        self
    }

    /// Set a keyword argument
    pub fn kwarg<T: Serialize>(self, name: impl Into<String>, value: T) -> Self {
        let captured = ArgValue::from_serialize(value);
        self.kwarg_result(name.into(), captured)
    }

    /// Set a keyword argument that is already an [`ArgValue`]
    pub fn kwarg_value(self, name: impl Into<String>, value: ArgValue) -> Self {
        self.kwarg_result(name.into(), Ok(value))
    }

    /// Set a keyword float, rejecting NaN and infinities
    pub fn float_kwarg(self, name: impl Into<String>, value: f64) -> Self {
        let captured = ArgValue::float(value);
        self.kwarg_result(name.into(), captured)
    }

    /// Set a keyword secret reference
    pub fn secret_kwarg(self, name: impl Into<String>, secret: SecretRef) -> Self {
        self.kwarg_value(name, ArgValue::Secret(secret))
    }

    fn kwarg_result(mut self, name: String, captured: std::result::Result<ArgValue, String>) -> Self {
        match captured {
            Ok(value) => {
                if self.keyword_args.contains_key(&name) {
                    self.fail(name, "keyword argument given more than once".to_string());
                } else {
                    self.keyword_args.insert(name, value);
                }
            }
            Err(reason) => self.fail(name, reason),
        }
        self
    }

    /// Finish the record
    pub fn build(self) -> Result<InitializationRecord> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.type_identifier.is_empty() {
            return Err(NewhelmError::UnrecordableArgument {
                type_identifier: String::new(),
                argument: "type_identifier".to_string(),
                reason: "type identifier must not be empty".to_string(),
            });
        }
        Ok(InitializationRecord {
            type_identifier: self.type_identifier,
            positional_args: self.positional_args,
            keyword_args: self.keyword_args,
        })
    }
}

/// Implemented by objects that keep the record they were constructed from
pub trait Recorded {
    fn initialization_record(&self) -> &InitializationRecord;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_keyword_order_does_not_matter() {
        let a = InitializationRecord::builder("demo")
            .kwarg("dataset", "demo-v1")
            .kwarg("limit", 10)
            .build()
            .unwrap();
        let b = InitializationRecord::builder("demo")
            .kwarg("limit", 10)
            .kwarg("dataset", "demo-v1")
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_positional_order_matters() {
        let a = InitializationRecord::builder("demo").arg(1).arg(2).build().unwrap();
        let b = InitializationRecord::builder("demo").arg(2).arg(1).build().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_json_round_trip() {
        let record = InitializationRecord::builder("together_sut")
            .arg("llama-2-7b")
            .kwarg("options", json!({"max_tokens": 100, "stop": ["\n"]}))
            .secret_kwarg("api_key", SecretRef::required("together", "api_key"))
            .build()
            .unwrap();

        let json = record.to_json().unwrap();
        let restored = InitializationRecord::from_json(&json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_non_string_map_keys_are_unrecordable() {
        let mut weird: HashMap<(u8, u8), u8> = HashMap::new();
        weird.insert((1, 2), 3);

        let err = InitializationRecord::builder("demo")
            .kwarg("table", weird)
            .build()
            .unwrap_err();
        match err {
            NewhelmError::UnrecordableArgument { argument, type_identifier, .. } => {
                assert_eq!(argument, "table");
                assert_eq!(type_identifier, "demo");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_finite_float_is_unrecordable() {
        let err = InitializationRecord::builder("demo")
            .arg("ok")
            .float_arg(f64::NAN)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            NewhelmError::UnrecordableArgument { ref argument, .. } if argument == "#1"
        ));
    }

    #[test]
    fn test_non_finite_float_through_kwarg_is_unrecordable() {
        let err = InitializationRecord::builder("sut")
            .kwarg("temperature", f64::NAN)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            NewhelmError::UnrecordableArgument { ref argument, .. } if argument == "temperature"
        ));

        let nested = InitializationRecord::builder("sut")
            .arg(vec![0.1, f64::INFINITY])
            .build();
        assert!(matches!(
            nested,
            Err(NewhelmError::UnrecordableArgument { ref argument, .. }) if argument == "#0"
        ));

        let absent = InitializationRecord::builder("sut")
            .kwarg("temperature", None::<f64>)
            .build()
            .unwrap();
        assert_eq!(absent.to_string(), "sut(temperature=null)");
    }

    #[test]
    fn test_float_arguments_survive_json_round_trip() {
        // Shortest repr of this value parses to a neighbouring f64 without
        // exact float parsing
        let awkward = 1.0715660391465826e-75_f64;
        let record = InitializationRecord::builder("sut")
            .kwarg("logprob_floor", awkward)
            .arg(vec![0.1, 1.0 / 3.0, awkward])
            .build()
            .unwrap();

        let restored = InitializationRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(restored, record);
        assert_eq!(
            restored.keyword("logprob_floor").and_then(|v| v.as_value()).and_then(|v| v.as_f64()),
            Some(awkward)
        );
        assert_eq!(
            crate::fingerprint::fingerprint_record(&restored).unwrap(),
            crate::fingerprint::fingerprint_record(&record).unwrap()
        );
    }

    #[test]
    fn test_duplicate_kwarg_rejected() {
        let result = InitializationRecord::builder("demo")
            .kwarg("limit", 1)
            .kwarg("limit", 2)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_type_identifier_rejected() {
        assert!(InitializationRecord::bare("").is_err());
    }

    #[test]
    fn test_secret_value_never_recorded() {
        let record = InitializationRecord::builder("openai_sut")
            .secret_kwarg("api_key", SecretRef::required("openai", "api_key"))
            .build()
            .unwrap();

        assert_eq!(record.secret_refs().count(), 1);
        assert_eq!(record.to_string(), "openai_sut(api_key=<secret openai/api_key>)");
    }

    #[test]
    fn test_display_provenance_form() {
        let record = InitializationRecord::builder("demo_01")
            .arg(json!({"b": 1, "a": 2}))
            .kwarg("limit", 10)
            .build()
            .unwrap();
        assert_eq!(record.to_string(), r#"demo_01({"a":2,"b":1}, limit=10)"#);
    }
}
