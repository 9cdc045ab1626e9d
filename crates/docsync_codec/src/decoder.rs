//! Canonical CBOR decoder.

use crate::document::Document;
use crate::encoder::{TAG_DATETIME, TAG_INT32, TAG_OBJECT_ID};
use crate::error::{CodecError, CodecResult};
use crate::value::{ObjectId, Value};

/// Decode a single value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid canonical CBOR, use a tag
/// this codec does not know, or contain trailing data.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// Decode a document from CBOR bytes.
pub fn document_from_cbor(bytes: &[u8]) -> CodecResult<Document> {
    match from_cbor(bytes)? {
        Value::Document(d) => Ok(d),
        other => Err(CodecError::type_mismatch("<root>", "document", other.type_name())),
    }
}

/// A canonical CBOR decoder.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Maximum allowed element count for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let additional_info = initial_byte & 0x1f;

        match major_type {
            0 | 1 => self.decode_integer(major_type, additional_info).map(Value::Int64),
            2 => self.decode_bytes(additional_info).map(Value::Binary),
            3 => self.decode_text(additional_info).map(Value::String),
            4 => self.decode_array(additional_info),
            5 => self.decode_map(additional_info).map(Value::Document),
            6 => self.decode_tagged(additional_info),
            7 => self.decode_simple(additional_info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn decode_unsigned(&mut self, additional_info: u8) -> CodecResult<u64> {
        let non_canonical =
            || CodecError::invalid_structure("non-canonical: value could be encoded in fewer bytes");
        match additional_info {
            0..=23 => Ok(u64::from(additional_info)),
            24 => {
                let byte = self.read_byte()?;
                if byte < 24 {
                    return Err(non_canonical());
                }
                Ok(u64::from(byte))
            }
            25 => {
                let bytes = self.read_bytes(2)?;
                let value = u16::from_be_bytes([bytes[0], bytes[1]]);
                if u8::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            26 => {
                let bytes = self.read_bytes(4)?;
                let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if u16::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let value = u64::from_be_bytes(raw);
                if u32::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(value)
            }
            28..=30 => Err(CodecError::invalid_structure("reserved additional info")),
            _ => Err(CodecError::IndefiniteLengthForbidden),
        }
    }

    fn decode_integer(&mut self, major_type: u8, additional_info: u8) -> CodecResult<i64> {
        let n = self.decode_unsigned(additional_info)?;
        let n = i64::try_from(n)
            .map_err(|_| CodecError::decoding_failed("integer exceeds 64-bit signed range"))?;
        Ok(if major_type == 0 { n } else { -n - 1 })
    }

    fn decode_length(&mut self, additional_info: u8, max: u64) -> CodecResult<usize> {
        let len = self.decode_unsigned(additional_info)?;
        if len > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: max,
            });
        }
        usize::try_from(len).map_err(|_| CodecError::decoding_failed("length overflows usize"))
    }

    fn decode_bytes(&mut self, additional_info: u8) -> CodecResult<Vec<u8>> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn decode_text(&mut self, additional_info: u8) -> CodecResult<String> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        let bytes = self.read_bytes(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(text.to_string())
    }

    fn decode_array(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.decode()?);
        }
        Ok(Value::Array(items))
    }

    fn decode_map(&mut self, additional_info: u8) -> CodecResult<Document> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        let mut document = Document::with_capacity(len.min(1024));
        let mut prev_key_bytes: Option<&'a [u8]> = None;

        for _ in 0..len {
            let key_start = self.pos;
            let initial = self.read_byte()?;
            if initial >> 5 != 3 {
                return Err(CodecError::invalid_structure("document keys must be text"));
            }
            let key = self.decode_text(initial & 0x1f)?;
            let data = self.data;
            let key_bytes = &data[key_start..self.pos];

            // Keys must be strictly increasing (length-first, then bytewise)
            if let Some(prev) = prev_key_bytes {
                let ordering = prev.len().cmp(&key_bytes.len()).then_with(|| prev.cmp(key_bytes));
                if ordering != std::cmp::Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }
            prev_key_bytes = Some(key_bytes);

            let value = self.decode()?;
            document.insert(key, value);
        }

        Ok(document)
    }

    fn decode_tagged(&mut self, additional_info: u8) -> CodecResult<Value> {
        let tag = self.decode_unsigned(additional_info)?;
        match tag {
            TAG_INT32 => match self.decode()? {
                Value::Int64(n) => i32::try_from(n)
                    .map(Value::Int32)
                    .map_err(|_| CodecError::decoding_failed("int32 tag out of range")),
                other => Err(CodecError::type_mismatch("<int32>", "integer", other.type_name())),
            },
            TAG_OBJECT_ID => match self.decode()? {
                Value::Binary(bytes) => {
                    let raw: [u8; 12] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| CodecError::decoding_failed("object id must be 12 bytes"))?;
                    Ok(Value::ObjectId(ObjectId::from_bytes(raw)))
                }
                other => Err(CodecError::type_mismatch("<objectId>", "binary", other.type_name())),
            },
            TAG_DATETIME => match self.decode()? {
                Value::Int64(t) => Ok(Value::DateTime(t)),
                other => Err(CodecError::type_mismatch("<date>", "integer", other.type_name())),
            },
            other => Err(CodecError::decoding_failed(format!("unknown tag {other}"))),
        }
    }

    fn decode_simple(&mut self, additional_info: u8) -> CodecResult<Value> {
        match additional_info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Double(f64::from_bits(u64::from_be_bytes(raw))))
            }
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: doubles must use the 8-byte form",
            )),
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            other => Err(CodecError::decoding_failed(format!(
                "unsupported simple value {other}"
            ))),
        }
    }
}
