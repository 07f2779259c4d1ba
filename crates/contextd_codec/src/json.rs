//! Extended JSON bridge.
//!
//! RPC bodies travel as JSON, which has no native date or binary type.
//! Those are carried as single-key wrapper objects:
//!
//! | Value | Extended JSON |
//! |---|---|
//! | `Timestamp` | `{"$date": 1704067200000}` (epoch millis; input also accepts RFC 3339 text) |
//! | `Bytes` | `{"$binary": "<lowercase hex>"}` |
//!
//! `$date` matches the EJSON dialect existing clients speak. `$binary` does
//! not: EJSON carries base64 there, this bridge carries hex, so binary
//! fields from such clients must be converted before they are sent.
//!
//! Integral numbers become integers and the rest floats. Integers beyond
//! the `i64` range are rejected rather than rounded.

use crate::error::{CodecError, CodecResult};
use crate::value::{check_timestamp, parse_rfc3339, Value};
use serde_json::{Map, Number, Value as Json};

const DATE_KEY: &str = "$date";
const BINARY_KEY: &str = "$binary";

/// Convert a value into extended JSON.
///
/// # Errors
///
/// Fails for non-finite floats and for timestamps outside the
/// representable calendar range.
pub fn to_json(value: &Value) -> CodecResult<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(n) => Json::Number(Number::from(*n)),
        Value::Float(f) => match Value::number(*f) {
            Value::Integer(n) => Json::Number(Number::from(n)),
            _ => Number::from_f64(*f)
                .map(Json::Number)
                .ok_or(CodecError::NonFiniteFloat)?,
        },
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => wrapper(BINARY_KEY, Json::String(hex::encode(b))),
        Value::Timestamp(ms) => {
            wrapper(DATE_KEY, Json::Number(Number::from(check_timestamp(*ms)?)))
        }
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect::<CodecResult<_>>()?),
        Value::Map(pairs) => {
            let mut map = Map::with_capacity(pairs.len());
            for (key, value) in pairs {
                map.insert(key.clone(), to_json(value)?);
            }
            Json::Object(map)
        }
    })
}

/// Convert extended JSON into a value.
///
/// # Errors
///
/// Returns [`CodecError::InvalidJson`] for integers beyond `i64` or
/// malformed wrappers, and [`CodecError::InvalidTimestamp`] for dates
/// outside the representable range.
pub fn from_json(json: &Json) -> CodecResult<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => parse_number(n),
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Array(items) => items
            .iter()
            .map(from_json)
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some(date) = map.get(DATE_KEY) {
                    return parse_date(date);
                }
                if let Some(binary) = map.get(BINARY_KEY) {
                    return parse_binary(binary);
                }
            }
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map {
                pairs.push((key.clone(), from_json(value)?));
            }
            Ok(Value::map(pairs))
        }
    }
}

/// Parse an extended JSON document from text.
///
/// # Errors
///
/// Returns an error if the text is not JSON or does not map to a value.
pub fn parse_json(text: &str) -> CodecResult<Value> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| CodecError::invalid_json(e.to_string()))?;
    from_json(&json)
}

/// Render a value as compact extended JSON text.
///
/// # Errors
///
/// Fails for non-finite floats and for timestamps outside the
/// representable calendar range.
pub fn to_json_string(value: &Value) -> CodecResult<String> {
    Ok(to_json(value)?.to_string())
}

fn wrapper(key: &str, inner: Json) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), inner);
    Json::Object(map)
}

fn parse_number(n: &Number) -> CodecResult<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Integer(i));
    }
    if n.is_u64() {
        return Err(CodecError::invalid_json(format!("integer {n} out of range")));
    }
    n.as_f64()
        .map(Value::number)
        .ok_or_else(|| CodecError::invalid_json(format!("bad number {n}")))
}

fn parse_date(date: &Json) -> CodecResult<Value> {
    match date {
        Json::String(text) => parse_rfc3339(text).map(Value::Timestamp),
        Json::Number(n) => n
            .as_i64()
            .ok_or_else(|| CodecError::invalid_timestamp(n.to_string()))
            .and_then(Value::timestamp),
        other => Err(CodecError::invalid_json(format!("bad $date: {other}"))),
    }
}

fn parse_binary(binary: &Json) -> CodecResult<Value> {
    binary
        .as_str()
        .and_then(|s| hex::decode(s).ok())
        .map(Value::Bytes)
        .ok_or_else(|| CodecError::invalid_json(format!("bad $binary: {binary}")))
}
