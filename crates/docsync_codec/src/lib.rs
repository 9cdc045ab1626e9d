//! # docsync codec
//!
//! Document model and canonical encoding for docsync.
//!
//! This crate provides:
//! - [`Value`] and [`Document`], a BSON-like value model with BSON-aware
//!   equality (NaN equals NaN, binary compared byte-wise)
//! - Deterministic CBOR encoding, so equal documents produce identical bytes
//! - [`document_hash`], the 64-bit content hash used for divergence checks
//! - The [`doc!`] macro for building documents
//!
//! ## Usage
//!
//! ```
//! use docsync_codec::{doc, document_from_cbor, document_to_cbor};
//!
//! let document = doc! { "_id" => 1, "name" => "ada" };
//! let bytes = document_to_cbor(&document).unwrap();
//! assert_eq!(document_from_cbor(&bytes).unwrap(), document);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod document;
mod encoder;
mod error;
mod hash;
mod value;

pub use decoder::{document_from_cbor, from_cbor, CanonicalDecoder};
pub use document::Document;
pub use encoder::{document_to_cbor, to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use hash::document_hash;
pub use value::{ObjectId, Value};

/// Builds a [`Document`] from `key => value` pairs.
///
/// Values go through `Value::from`, so literals, strings, nested
/// documents and vectors can be used directly.
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ( $( $key:expr => $value:expr ),+ $(,)? ) => {{
        let mut document = $crate::Document::new();
        $( document.insert($key, $crate::Value::from($value)); )+
        document
    }};
}

/// Trait for types that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from CBOR.
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

impl Encode for Document {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        document_to_cbor(self)
    }
}

impl Decode for Document {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        document_from_cbor(bytes)
    }
}
