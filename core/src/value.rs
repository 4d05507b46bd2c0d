//! Database-agnostic values and semantic column types.
//!
//! [`Value`] is what flows between entities, query parameters and the
//! driver. [`DataType`] is the semantic type tag a column carries; dialects
//! turn it into a concrete type token.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{OrmError, Result};

/// Text formats accepted when coercing stored text into a timestamp.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// A single column or parameter value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a driver value into the representation of `data_type`.
    ///
    /// `Integer` columns are 32-bit: a stored 64-bit integer is narrowed with
    /// two's-complement wrapping (`i64 as i32`). This is a defined narrowing,
    /// values outside the 32-bit range wrap rather than fail.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when the value has no
    /// sensible reading as the requested type.
    pub fn coerce(self, data_type: &DataType) -> Result<Value> {
        let mismatch = |value: &Value| {
            OrmError::mapping(format!(
                "cannot read {} as {data_type}",
                value.kind_name()
            ))
        };

        match (data_type, self) {
            (_, Value::Null) => Ok(Value::Null),
            (DataType::Integer, Value::Integer(i)) => Ok(Value::Integer(i64::from(i as i32))),
            (DataType::Integer, Value::Boolean(b)) => Ok(Value::Integer(i64::from(b))),
            (DataType::BigInt, Value::Integer(i)) => Ok(Value::Integer(i)),
            (DataType::BigInt, Value::Boolean(b)) => Ok(Value::Integer(i64::from(b))),
            (DataType::Float, Value::Real(f)) => Ok(Value::Real(f)),
            (DataType::Float, Value::Integer(i)) => Ok(Value::Real(i as f64)),
            (DataType::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
            (DataType::Boolean, Value::Integer(i)) => Ok(Value::Boolean(i != 0)),
            (DataType::Text { .. }, Value::Text(s)) => Ok(Value::Text(s)),
            (DataType::Text { .. }, Value::Integer(i)) => Ok(Value::Text(i.to_string())),
            (DataType::Timestamp, Value::Timestamp(t)) => Ok(Value::Timestamp(t)),
            (DataType::Timestamp, Value::Text(s)) => parse_timestamp(&s)
                .map(Value::Timestamp)
                .ok_or_else(|| OrmError::mapping(format!("invalid timestamp text '{s}'"))),
            (DataType::Timestamp, Value::Integer(secs)) => DateTime::from_timestamp(secs, 0)
                .map(|dt| Value::Timestamp(dt.naive_utc()))
                .ok_or_else(|| OrmError::mapping(format!("timestamp {secs} out of range"))),
            (DataType::Blob, Value::Blob(b)) => Ok(Value::Blob(b)),
            (DataType::Blob, Value::Text(s)) => Ok(Value::Blob(s.into_bytes())),
            (DataType::Custom(_), value) => Ok(value),
            (_, value) => Err(mismatch(&value)),
        }
    }

    /// Returns the hashable key form of this value, if it can identify a row.
    ///
    /// `Null` and floating point values never identify a row.
    pub fn to_key(&self) -> Option<EntityKey> {
        match self {
            Value::Integer(i) => Some(EntityKey::Integer(*i)),
            Value::Boolean(b) => Some(EntityKey::Integer(i64::from(*b))),
            Value::Text(s) => Some(EntityKey::Text(s.clone())),
            Value::Timestamp(t) => Some(EntityKey::Timestamp(*t)),
            Value::Blob(b) => Some(EntityKey::Blob(b.clone())),
            Value::Null | Value::Real(_) => None,
        }
    }

    /// Short lowercase name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Blob(_) => "blob",
        }
    }

    /// Writes a stable byte encoding of the value into `out`.
    ///
    /// Used for content hashing; each variant is prefixed with a tag byte so
    /// that e.g. `Text("1")` and `Integer(1)` never collide.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Integer(i) => {
                out.push(1);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Real(f) => {
                out.push(2);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                out.push(3);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Boolean(b) => {
                out.push(4);
                out.push(u8::from(*b));
            }
            Value::Timestamp(t) => {
                out.push(5);
                out.extend_from_slice(&t.and_utc().timestamp_micros().to_le_bytes());
            }
            Value::Blob(b) => {
                out.push(6);
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// Hashable identity of a row, derived from its primary-key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    Integer(i64),
    Text(String),
    Timestamp(NaiveDateTime),
    Blob(Vec<u8>),
}

impl EntityKey {
    /// Converts the key back into a parameter value.
    pub fn to_value(&self) -> Value {
        match self {
            EntityKey::Integer(i) => Value::Integer(*i),
            EntityKey::Text(s) => Value::Text(s.clone()),
            EntityKey::Timestamp(t) => Value::Timestamp(*t),
            EntityKey::Blob(b) => Value::Blob(b.clone()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Integer(i) => write!(f, "{i}"),
            EntityKey::Text(s) => write!(f, "{s}"),
            EntityKey::Timestamp(t) => write!(f, "{t}"),
            EntityKey::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        EntityKey::Integer(value)
    }
}

impl From<i32> for EntityKey {
    fn from(value: i32) -> Self {
        EntityKey::Integer(i64::from(value))
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        EntityKey::Text(value.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        EntityKey::Text(value)
    }
}

/// Semantic, database-agnostic column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Character data with optional length bounds.
    Text {
        max_length: Option<usize>,
        min_length: Option<usize>,
    },
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    Float,
    Boolean,
    Timestamp,
    Blob,
    /// Application-defined tag the dialect must have a mapping for.
    Custom(String),
}

impl DataType {
    /// Returns `true` if the type can carry a length constraint.
    pub fn has_length(&self) -> bool {
        matches!(self, DataType::Text { .. } | DataType::Blob)
    }

    /// Returns `true` if values of this type can identify a row.
    pub fn is_key_capable(&self) -> bool {
        !matches!(self, DataType::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Text {
                max_length: Some(max),
                ..
            } => write!(f, "text({max})"),
            DataType::Text { .. } => f.write_str("text"),
            DataType::Integer => f.write_str("integer"),
            DataType::BigInt => f.write_str("bigint"),
            DataType::Float => f.write_str("float"),
            DataType::Boolean => f.write_str("boolean"),
            DataType::Timestamp => f.write_str("timestamp"),
            DataType::Blob => f.write_str("blob"),
            DataType::Custom(tag) => write!(f, "custom({tag})"),
        }
    }
}

/// Typed extraction from a [`Value`].
pub trait FromValue: Sized {
    /// Reads `value` as `Self`.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] on a type mismatch.
    fn from_value(value: &Value) -> Result<Self>;
}

fn type_mismatch<T>(value: &Value) -> Result<T> {
    Err(OrmError::mapping(format!(
        "cannot convert {} value to {}",
        value.kind_name(),
        std::any::type_name::<T>()
    )))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(*i),
            Value::Boolean(b) => Ok(i64::from(*b)),
            other => type_mismatch(other),
        }
    }
}

impl FromValue for i32 {
    /// Narrows 64-bit integers with wrapping, see [`Value::coerce`].
    fn from_value(value: &Value) -> Result<Self> {
        i64::from_value(value).map(|i| i as i32)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Real(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            other => type_mismatch(other),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::Integer(i) => Ok(*i != 0),
            other => type_mismatch(other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => type_mismatch(other),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value.clone().coerce(&DataType::Timestamp)? {
            Value::Timestamp(t) => Ok(t),
            other => type_mismatch(&other),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            other => type_mismatch(other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

value_from! {
    i64 => Integer,
    i32 => Integer,
    f64 => Real,
    bool => Boolean,
    String => Text,
    &str => Text,
    NaiveDateTime => Timestamp,
    Vec<u8> => Blob,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<EntityKey> for Value {
    fn from(key: EntityKey) -> Self {
        key.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_column_narrows_with_wrapping() {
        let wide = Value::Integer(i64::from(i32::MAX) + 1);
        let narrowed = wide.coerce(&DataType::Integer).unwrap();
        assert_eq!(narrowed, Value::Integer(i64::from(i32::MIN)));
    }

    #[test]
    fn test_boolean_from_integer_storage() {
        assert_eq!(
            Value::Integer(1).coerce(&DataType::Boolean).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::Integer(0).coerce(&DataType::Boolean).unwrap(),
            Value::Boolean(false)
        );
    }

    #[test]
    fn test_timestamp_from_text() {
        let value = Value::Text("2024-03-01 12:30:00".into())
            .coerce(&DataType::Timestamp)
            .unwrap();
        let expected =
            NaiveDateTime::parse_from_str("2024-03-01 12:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(value, Value::Timestamp(expected));
    }

    #[test]
    fn test_coerce_rejects_text_as_integer() {
        let err = Value::Text("abc".into())
            .coerce(&DataType::Integer)
            .unwrap_err();
        assert!(matches!(err, OrmError::ObjectMappingError(_)));
    }

    #[test]
    fn test_null_survives_any_coercion() {
        assert_eq!(Value::Null.coerce(&DataType::Float).unwrap(), Value::Null);
    }

    #[test]
    fn test_float_is_not_a_key() {
        assert!(Value::Real(1.5).to_key().is_none());
        assert!(Value::Null.to_key().is_none());
        assert_eq!(Value::Integer(7).to_key(), Some(EntityKey::Integer(7)));
    }

    #[test]
    fn test_from_value_option() {
        assert_eq!(Option::<i32>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Option::<i32>::from_value(&Value::Integer(3)).unwrap(), Some(3));
        assert!(String::from_value(&Value::Integer(3)).is_err());
    }

    #[test]
    fn test_encoding_distinguishes_variants() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Value::Text("1".into()).encode_into(&mut a);
        Value::Integer(1).encode_into(&mut b);
        assert_ne!(a, b);
    }
}
