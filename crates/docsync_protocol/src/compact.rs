//! Compact change events for on-disk bookkeeping.

use std::hash::{Hash, Hasher};

use docsync_codec::{Document, Value};

use crate::change_event::{optional_bool, optional_document};
use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::OperationType;
use crate::update_description::UpdateDescription;
use crate::version::{Version, ID_FIELD};

/// A change event without namespace or event id, carrying the document's
/// hash and version instead.
///
/// Encoded with short keys: `ot`, `dk`, `ud`, `hasUncommittedWrites`,
/// `sdh`, `sdv`, `fd`.
#[derive(Debug, Clone)]
pub struct CompactChangeEvent<T = Document> {
    /// Kind of mutation.
    pub operation_type: OperationType,
    /// `{_id: ...}` of the affected document.
    pub document_key: Document,
    /// Changed fields, for `update` only.
    pub update_description: Option<UpdateDescription>,
    /// True while a local write has not been acknowledged remotely.
    pub has_uncommitted_writes: bool,
    /// Post-image, when there is one.
    pub full_document: Option<T>,
    /// Content hash of the document.
    pub stitch_document_hash: i64,
    /// Version of the document, when known.
    pub stitch_document_version: Option<Version>,
}

impl<T> PartialEq for CompactChangeEvent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.document_key == other.document_key
            && self.operation_type == other.operation_type
            && self.has_uncommitted_writes == other.has_uncommitted_writes
    }
}

impl<T> Eq for CompactChangeEvent<T> {}

impl<T> Hash for CompactChangeEvent<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.document_key.hash(state);
        self.operation_type.hash(state);
        self.has_uncommitted_writes.hash(state);
    }
}

impl<T> CompactChangeEvent<T> {
    /// The `_id` of the affected document.
    pub fn document_id(&self) -> Option<&Value> {
        self.document_key.get(ID_FIELD)
    }
}

impl CompactChangeEvent<Document> {
    /// Encodes with the short keys.
    pub fn to_document(&self) -> Document {
        let mut document = Document::with_capacity(7);
        document.insert("ot", self.operation_type.as_str());
        document.insert("dk", self.document_key.clone());
        if let Some(update) = &self.update_description {
            document.insert("ud", update.to_document());
        }
        document.insert("hasUncommittedWrites", self.has_uncommitted_writes);
        if let Some(full) = &self.full_document {
            document.insert("fd", full.clone());
        }
        document.insert("sdh", self.stitch_document_hash);
        if let Some(version) = &self.stitch_document_version {
            document.insert("sdv", version.to_document());
        }
        document
    }

    /// Decodes the short-key form.
    ///
    /// `ot`, `dk` and `sdh` are required. Everything else may be missing or
    /// null: `hasUncommittedWrites` then defaults to false.
    pub fn from_document(document: &Document) -> ProtocolResult<Self> {
        let operation_type = OperationType::parse(document.require_str("ot")?);
        let document_key = document.require_document("dk")?.clone();
        let update_description = optional_document(document, "ud")?
            .map(UpdateDescription::from_document)
            .transpose()?;
        let has_uncommitted_writes = optional_bool(document, "hasUncommittedWrites")?;
        let full_document = optional_document(document, "fd")?.cloned();
        let stitch_document_hash = match document.get("sdh") {
            Some(Value::Int64(h)) => *h,
            Some(Value::Int32(h)) => i64::from(*h),
            Some(other) => {
                return Err(ProtocolError::decoding(format!(
                    "sdh must be an integer, found {}",
                    other.type_name()
                )))
            }
            None => return Err(ProtocolError::decoding("missing stitch document hash")),
        };
        let stitch_document_version = optional_document(document, "sdv")?
            .map(Version::from_document)
            .transpose()?;
        Ok(Self {
            operation_type,
            document_key,
            update_description,
            has_uncommitted_writes,
            full_document,
            stitch_document_hash,
            stitch_document_version,
        })
    }
}
