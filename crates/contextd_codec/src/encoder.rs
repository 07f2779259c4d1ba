//! Canonical CBOR encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{cmp_keys, format_rfc3339, integral_i64, Value};

/// CBOR tag for a standard date/time string (RFC 8949 §3.4.1).
pub const DATETIME_TAG: u64 = 0;

/// Encode a value to canonical CBOR bytes.
///
/// This function produces deterministic output following the canonical
/// CBOR rules specified in RFC 8949 Section 4.2.1:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - Floats are always float64, and a float holding an integer encodes as
///   that integer
/// - No indefinite-length encoding
///
/// Timestamps are written as tag 0 over an RFC 3339 string with millisecond
/// precision in UTC, so one instant always has one encoding.
///
/// # Errors
///
/// Returns an error if a map repeats a key, a float is NaN or infinite, or
/// a timestamp is out of range.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// A canonical CBOR encoder.
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Encode a value.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            // CBOR null is simple value 22, false/true are 20/21.
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(b) => self.buffer.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Float(f) => self.encode_float(*f)?,
            Value::Bytes(b) => {
                self.encode_head(2, b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => self.encode_text(s),
            Value::Timestamp(millis) => {
                let text = format_rfc3339(*millis)?;
                self.encode_head(6, DATETIME_TAG);
                self.encode_text(&text);
            }
            Value::Array(items) => {
                self.encode_head(4, items.len() as u64);
                for item in items {
                    self.encode(item)?;
                }
            }
            Value::Map(pairs) => self.encode_map(pairs)?,
        }
        Ok(())
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_head(0, n as u64);
        } else {
            // -1 encodes as 0, -2 as 1, and so on.
            self.encode_head(1, (-(n + 1)) as u64);
        }
    }

    fn encode_float(&mut self, f: f64) -> CodecResult<()> {
        if !f.is_finite() {
            return Err(CodecError::NonFiniteFloat);
        }
        match integral_i64(f) {
            Some(n) => self.encode_integer(n),
            None => {
                self.buffer.push(0xfb);
                self.buffer.extend_from_slice(&f.to_be_bytes());
            }
        }
        Ok(())
    }

    fn encode_text(&mut self, text: &str) {
        self.encode_head(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_head(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if value <= u64::from(u8::MAX) {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if value <= u64::from(u32::MAX) {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn encode_map(&mut self, pairs: &[(String, Value)]) -> CodecResult<()> {
        // Maps built with `Value::Map(..)` directly may be unsorted.
        let mut sorted: Vec<&(String, Value)> = pairs.iter().collect();
        sorted.sort_by(|a, b| cmp_keys(&a.0, &b.0));
        if let Some(pair) = sorted.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(CodecError::encoding_failed(format!(
                "duplicate map key {:?}",
                pair[0].0
            )));
        }

        self.encode_head(5, pairs.len() as u64);
        for (key, value) in sorted {
            self.encode_text(key);
            self.encode(value)?;
        }
        Ok(())
    }
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}
