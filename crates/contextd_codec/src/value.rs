//! Dynamic document value type.

use crate::error::{CodecError, CodecResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

/// A dynamic document value.
///
/// Documents are maps with text keys. A float with an integral value in
/// the `i64` range encodes as that integer, so build numbers from `f64`
/// with [`Value::number`] to keep equality in line with the encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (supports full i64 range).
    Integer(i64),
    /// Finite 64-bit float.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Instant in milliseconds since the Unix epoch (UTC).
    Timestamp(i64),
    /// Array of values.
    Array(Vec<Value>),
    /// Map with text keys, kept in canonical key order by the constructors.
    Map(Vec<(String, Value)>),
}

/// Earliest instant with a four-digit RFC 3339 year, 0001-01-01T00:00:00.000Z.
pub const MIN_TIMESTAMP_MILLIS: i64 = -62_135_596_800_000;

/// Latest instant with a four-digit RFC 3339 year, 9999-12-31T23:59:59.999Z.
pub const MAX_TIMESTAMP_MILLIS: i64 = 253_402_300_799_999;

/// Compare two map keys the way canonical CBOR orders their encodings.
///
/// A text key's encoded header grows with its length, so the bytewise
/// order of encodings is length-first, then lexicographic.
pub fn cmp_keys(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl Value {
    /// Create a map value from pairs, sorting keys canonically.
    ///
    /// When a key occurs more than once the last pair wins.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut map = Value::Map(Vec::new());
        for (key, value) in pairs {
            map.insert(key, value);
        }
        map
    }

    /// An empty map.
    pub fn empty_map() -> Self {
        Value::Map(Vec::new())
    }

    /// A number from a float, collapsing integral values to [`Value::Integer`].
    ///
    /// `-0.0` becomes `0`.
    pub fn number(f: f64) -> Self {
        match integral_i64(f) {
            Some(n) => Value::Integer(n),
            None => Value::Float(f),
        }
    }

    /// A timestamp, checked against the representable range.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidTimestamp`] outside
    /// [`MIN_TIMESTAMP_MILLIS`]..=[`MAX_TIMESTAMP_MILLIS`].
    pub fn timestamp(millis: i64) -> CodecResult<Self> {
        check_timestamp(millis).map(Value::Timestamp)
    }

    /// The current time as a timestamp value.
    pub fn now() -> Self {
        Value::Timestamp(Utc::now().timestamp_millis())
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, widening integers.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as epoch milliseconds, if it is a timestamp.
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Mutable lookup of a key in this map value.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Value::Map(pairs) => pairs.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Insert or replace a key in this map value, keeping canonical order.
    ///
    /// Returns the previous value. Does nothing on non-map values.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let Value::Map(pairs) = self else {
            return None;
        };
        let key = key.into();
        match pairs.binary_search_by(|(k, _)| cmp_keys(k, &key)) {
            Ok(idx) => Some(std::mem::replace(&mut pairs[idx].1, value)),
            Err(idx) => {
                pairs.insert(idx, (key, value));
                None
            }
        }
    }

    /// Remove a key from this map value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Map(pairs) => {
                let idx = pairs.iter().position(|(k, _)| k == key)?;
                Some(pairs.remove(idx).1)
            }
            _ => None,
        }
    }

    /// Build a timestamp from an RFC 3339 string.
    pub fn parse_timestamp(text: &str) -> CodecResult<Self> {
        parse_rfc3339(text).map(Value::Timestamp)
    }
}

/// The integer a float stands for, if it is integral and fits in `i64`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn integral_i64(f: f64) -> Option<i64> {
    // 2^63 is exact as f64; the range is half-open.
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    (f.fract() == 0.0 && (-BOUND..BOUND).contains(&f)).then(|| f as i64)
}

pub(crate) fn check_timestamp(millis: i64) -> CodecResult<i64> {
    if (MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(&millis) {
        Ok(millis)
    } else {
        Err(CodecError::invalid_timestamp(millis.to_string()))
    }
}

/// Format epoch milliseconds as RFC 3339 with millisecond precision and `Z`.
///
/// # Errors
///
/// Fails outside [`MIN_TIMESTAMP_MILLIS`]..=[`MAX_TIMESTAMP_MILLIS`], where
/// the year would not fit in four digits and could not be parsed back.
pub fn format_rfc3339(millis: i64) -> CodecResult<String> {
    check_timestamp(millis)?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| CodecError::invalid_timestamp(millis.to_string()))
}

/// Parse an RFC 3339 string into epoch milliseconds.
///
/// # Errors
///
/// Fails on malformed text or an instant outside the range
/// [`format_rfc3339`] accepts.
pub fn parse_rfc3339(text: &str) -> CodecResult<i64> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| CodecError::invalid_timestamp(text))
        .and_then(check_timestamp)
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::number(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}
