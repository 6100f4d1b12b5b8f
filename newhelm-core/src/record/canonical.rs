//! Canonical JSON encoding
//!
//! Object keys are emitted in lexicographic order at every depth, with no
//! insignificant whitespace. The output does not depend on whether
//! `serde_json` was built with `preserve_order`. NaN and infinities have
//! no canonical form: `serde_json` would quietly write them as `null`, so
//! every `Serialize` input is checked before it is converted.

use serde::Serialize;
use serde::ser::{self, Error as _};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Rebuild `value` with every object's keys in sorted order
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Canonical bytes of an already-built JSON value
pub fn canonical_bytes(value: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&canonicalize(value))
}

/// Convert to JSON, failing on NaN or infinite floats
pub fn to_canonical_value<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Value> {
    value.serialize(FiniteCheck)?;
    serde_json::to_value(value)
}

/// Canonical bytes of any serializable value
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    canonical_bytes(&to_canonical_value(value)?)
}

fn check_float(value: f64) -> serde_json::Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(serde_json::Error::custom(format!(
            "non-finite float {} has no canonical form",
            value
        )))
    }
}

/// Walks a value without producing output, rejecting non-finite floats
struct FiniteCheck;

macro_rules! accept {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> serde_json::Result<()> {
                Ok(())
            }
        )*
    };
}

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
        serialize_char: char,
        serialize_str: &str,
        serialize_bytes: &[u8],
        serialize_unit_struct: &'static str,
    }

    fn serialize_f32(self, v: f32) -> serde_json::Result<()> {
        check_float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> serde_json::Result<()> {
        check_float(v)
    }

    fn serialize_none(self) -> serde_json::Result<()> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> serde_json::Result<()> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> serde_json::Result<()> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> serde_json::Result<()> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> serde_json::Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> serde_json::Result<()> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> serde_json::Result<Self> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> serde_json::Result<Self> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> serde_json::Result<()> {
        key.serialize(FiniteCheck)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> serde_json::Result<()> {
        value.serialize(FiniteCheck)
    }

    fn end(self) -> serde_json::Result<()> {
        Ok(())
    }
}

/// Whether two values are equal under canonical encoding
pub fn canonical_eq(a: &Value, b: &Value) -> serde_json::Result<bool> {
    Ok(canonical_bytes(a)? == canonical_bytes(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": null});
        let bytes = canonical_bytes(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_control_characters_are_escaped() {
        let bytes = canonical_bytes(&json!({"k": "a\u{1e}b"})).unwrap();
        assert!(!bytes.contains(&0x1e));
    }

    #[test]
    fn test_canonical_eq_ignores_key_order() {
        assert!(canonical_eq(&json!({"a": 1, "b": 2}), &json!({"b": 2, "a": 1})).unwrap());
        assert!(!canonical_eq(&json!({"a": 1}), &json!({"a": 1.0})).unwrap());
    }

    #[test]
    fn test_non_finite_floats_rejected_at_any_depth() {
        #[derive(Serialize)]
        struct Sampling {
            temperature: f64,
            stops: Vec<Option<f32>>,
        }

        assert!(to_canonical_value(&f64::NAN).is_err());
        assert!(to_canonical_value(&Some(f64::INFINITY)).is_err());
        assert!(to_canonical_value(&vec![1.0, f64::NEG_INFINITY]).is_err());
        assert!(
            to_canonical_value(&Sampling {
                temperature: 0.7,
                stops: vec![None, Some(f32::NAN)],
            })
            .is_err()
        );

        let ok = to_canonical_value(&Sampling {
            temperature: 0.7,
            stops: vec![None, Some(0.5)],
        })
        .unwrap();
        assert_eq!(ok, json!({"temperature": 0.7, "stops": [null, 0.5]}));
    }
}
