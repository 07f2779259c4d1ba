//! # contextd codec
//!
//! Canonical document values for contextd.
//!
//! Every replica must compute byte-identical digests from logically
//! identical transactions. This crate provides the value model and the
//! deterministic encoding those digests are taken over:
//! - Identical inputs produce identical bytes
//! - Map insertion order never changes the encoding
//! - Timestamps encode losslessly (millisecond precision)
//!
//! ## Canonical CBOR Rules
//!
//! - Maps have text keys sorted length-first, then bytewise
//! - Integers use shortest encoding
//! - Floats are finite, non-integral and always 64-bit; integral floats
//!   encode as integers
//! - No indefinite-length items
//! - Timestamps are tag 0 over an RFC 3339 UTC string with milliseconds,
//!   limited to years 0001 through 9999
//!
//! The [`json`] module bridges values to the extended JSON used on the RPC
//! surface.
//!
//! ## Usage
//!
//! ```
//! use contextd_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let doc = Value::map([("x", Value::Integer(1)), ("at", Value::Timestamp(0))]);
//! let bytes = to_canonical_cbor(&doc).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap(), doc);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
pub mod json;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder, DATETIME_TAG};
pub use error::{CodecError, CodecResult};
pub use value::{
    cmp_keys, format_rfc3339, parse_rfc3339, Value, MAX_TIMESTAMP_MILLIS, MIN_TIMESTAMP_MILLIS,
};

/// Types that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
