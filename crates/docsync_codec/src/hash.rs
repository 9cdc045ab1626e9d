//! Content hashing for documents.

use sha2::{Digest, Sha256};

use crate::document::Document;
use crate::encoder::document_to_cbor;

/// Computes the 64-bit content hash of a document.
///
/// The hash is the first eight bytes (big endian) of SHA-256 over the
/// canonical CBOR encoding, so it does not depend on field order.
pub fn document_hash(document: &Document) -> i64 {
    let mut hasher = Sha256::new();
    // Encoding a document cannot fail; an empty buffer would still hash.
    if let Ok(bytes) = document_to_cbor(document) {
        hasher.update(&bytes);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
