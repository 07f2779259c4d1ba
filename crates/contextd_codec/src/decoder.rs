//! Canonical CBOR decoder.

use crate::encoder::DATETIME_TAG;
use crate::error::{CodecError, CodecResult};
use crate::value::{cmp_keys, integral_i64, parse_rfc3339, Value};

/// Maximum allowed element count for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum nesting depth of arrays, maps and tags.
const MAX_DEPTH: usize = 128;

/// Decode exactly one value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid canonical CBOR, contain
/// forbidden constructs (short or non-finite floats, indefinite lengths,
/// non-text map keys), or
/// have bytes left over after the value.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - decoder.pos,
        });
    }
    Ok(value)
}

/// A canonical CBOR decoder.
///
/// Input that was not produced by the canonical encoder is rejected, so a
/// decoded value re-encodes to the same bytes.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Decode the next value.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let info = initial_byte & 0x1f;

        match major_type {
            0 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::unsupported_type("unsigned integer above i64::MAX"))
            }
            1 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::unsupported_type("negative integer below i64::MIN"))
            }
            2 => {
                let len = self.read_length(info)?;
                Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => self.decode_text(info).map(Value::Text),
            4 => self.nested(|d| {
                let len = d.read_count(info)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(d.decode()?);
                }
                Ok(Value::Array(items))
            }),
            5 => self.nested(|d| d.decode_map(info)),
            6 => self.nested(|d| d.decode_tagged(info)),
            7 => self.decode_simple(info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::invalid_structure("nesting too deep"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_argument(&mut self, info: u8) -> CodecResult<u64> {
        let (value, shortest_floor) = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => (u64::from(self.read_byte()?), 24),
            25 => {
                let b = self.read_bytes(2)?;
                (u64::from(u16::from_be_bytes([b[0], b[1]])), 0x100)
            }
            26 => {
                let b = self.read_bytes(4)?;
                (
                    u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    0x1_0000,
                )
            }
            27 => {
                let b = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                (u64::from_be_bytes(raw), 0x1_0000_0000)
            }
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };
        if value < shortest_floor {
            return Err(CodecError::invalid_structure(
                "non-canonical: value could be encoded in fewer bytes",
            ));
        }
        Ok(value)
    }

    fn read_length(&mut self, info: u8) -> CodecResult<usize> {
        let len = self.read_argument(info)?;
        if len > MAX_BYTES_LENGTH {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_BYTES_LENGTH,
            });
        }
        usize::try_from(len).map_err(|_| CodecError::UnexpectedEof)
    }

    fn read_count(&mut self, info: u8) -> CodecResult<usize> {
        let len = self.read_argument(info)?;
        if len > MAX_CONTAINER_ELEMENTS {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_CONTAINER_ELEMENTS,
            });
        }
        usize::try_from(len).map_err(|_| CodecError::UnexpectedEof)
    }

    fn decode_text(&mut self, info: u8) -> CodecResult<String> {
        let len = self.read_length(info)?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn decode_map(&mut self, info: u8) -> CodecResult<Value> {
        let len = self.read_count(info)?;
        let mut pairs: Vec<(String, Value)> = Vec::with_capacity(len.min(1024));

        for _ in 0..len {
            let head = self.read_byte()?;
            if head >> 5 != 3 {
                return Err(CodecError::invalid_structure("map keys must be text"));
            }
            let key = self.decode_text(head & 0x1f)?;

            // Keys must be strictly increasing
            if let Some((prev, _)) = pairs.last() {
                if cmp_keys(prev, &key) != std::cmp::Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }

            let value = self.decode()?;
            pairs.push((key, value));
        }

        Ok(Value::Map(pairs))
    }

    fn decode_tagged(&mut self, info: u8) -> CodecResult<Value> {
        let tag = self.read_argument(info)?;
        if tag != DATETIME_TAG {
            // Unknown tags carry no meaning for documents
            return self.decode();
        }
        match self.decode()? {
            Value::Text(text) => Ok(Value::Timestamp(parse_rfc3339(&text)?)),
            other => Err(CodecError::invalid_structure(format!(
                "date/time tag over {}",
                other.type_name()
            ))),
        }
    }

    fn decode_float(&mut self) -> CodecResult<Value> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        let f = f64::from_be_bytes(raw);
        if !f.is_finite() {
            return Err(CodecError::NonFiniteFloat);
        }
        if integral_i64(f).is_some() {
            return Err(CodecError::invalid_structure(
                "non-canonical: integral float",
            ));
        }
        Ok(Value::Float(f))
    }

    fn decode_simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            // undefined is read as null
            22 | 23 => Ok(Value::Null),
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: floats must be 64-bit",
            )),
            27 => self.decode_float(),
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            _ => Err(CodecError::unsupported_type(format!("simple value {info}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_canonical_cbor;

    #[test]
    fn decode_scalars() {
        assert_eq!(from_cbor(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf7]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
        assert_eq!(from_cbor(&[0x18, 255]).unwrap(), Value::Integer(255));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
        assert_eq!(
            from_cbor(&[0x43, 1, 2, 3]).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
        assert_eq!(
            from_cbor(&[0x62, b'h', b'i']).unwrap(),
            Value::Text("hi".to_string())
        );
    }

    #[test]
    fn decode_document() {
        let doc = Value::map([
            ("name", Value::from("Alice")),
            ("tags", Value::from(vec!["a", "b"])),
            ("at", Value::Timestamp(1_700_000_000_123)),
            ("nested", Value::map([("n", Value::Integer(-3))])),
        ]);
        let bytes = to_canonical_cbor(&doc).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), doc);
    }

    fn float64(f: f64) -> Vec<u8> {
        let mut bytes = vec![0xfb];
        bytes.extend_from_slice(&f.to_be_bytes());
        bytes
    }

    #[test]
    fn decode_float64() {
        assert_eq!(from_cbor(&float64(9.99)).unwrap(), Value::Float(9.99));
        assert_eq!(from_cbor(&float64(-1e300)).unwrap(), Value::Float(-1e300));
    }

    #[test]
    fn reject_non_canonical_floats() {
        assert!(matches!(
            from_cbor(&[0xf9, 0x3e, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0xfa, 0x3f, 0xc0, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
        for integral in [0.0, -0.0, 3.0] {
            assert!(matches!(
                from_cbor(&float64(integral)),
                Err(CodecError::InvalidStructure { .. })
            ));
        }
        assert_eq!(from_cbor(&float64(f64::NAN)), Err(CodecError::NonFiniteFloat));
        assert_eq!(
            from_cbor(&float64(f64::INFINITY)),
            Err(CodecError::NonFiniteFloat)
        );
    }

    #[test]
    fn out_of_range_datetime_rejected() {
        let text = b"+11476-08-15T05:20:00.000Z";
        let mut bytes = vec![0xc0, 0x60 | 24, text.len() as u8];
        bytes.extend_from_slice(text);
        assert!(matches!(
            from_cbor(&bytes),
            Err(CodecError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn reject_indefinite_length() {
        assert!(matches!(
            from_cbor(&[0x9f, 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
        assert!(matches!(
            from_cbor(&[0xbf, 0x61, b'a', 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x19, 0x00, 0xff]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unsorted_or_non_text_keys() {
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0xa1, 0x01, 0x01]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn unknown_tags_are_transparent() {
        // tag 32 (URI) over "a"
        assert_eq!(
            from_cbor(&[0xd8, 0x20, 0x61, b'a']).unwrap(),
            Value::Text("a".to_string())
        );
    }

    #[test]
    fn bad_datetime_tag_rejected() {
        assert!(from_cbor(&[0xc0, 0x01]).is_err());
        assert!(matches!(
            from_cbor(&[0xc0, 0x62, b'n', b'o']),
            Err(CodecError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn truncated_and_trailing_input() {
        assert!(matches!(from_cbor(&[]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(
            from_cbor(&[0x19, 0x01]),
            Err(CodecError::UnexpectedEof)
        ));
        assert!(matches!(
            from_cbor(&[0x01, 0x02]),
            Err(CodecError::TrailingBytes { remaining: 1 })
        ));
        assert!(matches!(
            from_cbor(&[0x62, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }
}
