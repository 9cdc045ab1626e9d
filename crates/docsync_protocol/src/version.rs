//! Document version tokens.
//!
//! Every synchronized document carries a version under
//! [`DOCUMENT_VERSION_FIELD`] once it has been written through the engine:
//!
//! ```text
//! { spv: 1, id: "<instance uuid>", v: <counter> }
//! ```
//!
//! The instance id changes when a document is (re)created; the counter
//! increases with every remote write made by the engine.

use docsync_codec::{doc, Document, Value};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Primary key field of every document.
pub const ID_FIELD: &str = "_id";

/// Reserved field holding the version token.
pub const DOCUMENT_VERSION_FIELD: &str = "__stitch_sync_version";

/// The only sync protocol version this engine speaks.
pub const SYNC_PROTOCOL_VERSION: i64 = 1;

const SPV_KEY: &str = "spv";
const INSTANCE_ID_KEY: &str = "id";
const COUNTER_KEY: &str = "v";

/// A decoded version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Protocol version that wrote this token.
    pub sync_protocol_version: i64,
    /// Identity of this incarnation of the document.
    pub instance_id: String,
    /// Write counter within the instance.
    pub version_counter: i64,
}

impl Version {
    /// A new instance with counter zero.
    pub fn fresh() -> Self {
        Self {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: Uuid::new_v4().to_string(),
            version_counter: 0,
        }
    }

    /// Same instance, counter plus one.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            sync_protocol_version: self.sync_protocol_version,
            instance_id: self.instance_id.clone(),
            version_counter: self.version_counter + 1,
        }
    }

    /// True when both tokens belong to the same document instance.
    pub fn same_instance(&self, other: &Version) -> bool {
        self.instance_id == other.instance_id
    }

    /// Encodes as `{spv, id, v}`.
    pub fn to_document(&self) -> Document {
        doc! {
            SPV_KEY => self.sync_protocol_version,
            INSTANCE_ID_KEY => self.instance_id.as_str(),
            COUNTER_KEY => self.version_counter,
        }
    }

    /// Decodes `{spv, id, v}`.
    pub fn from_document(document: &Document) -> ProtocolResult<Self> {
        Ok(Self {
            sync_protocol_version: document.require_i64(SPV_KEY)?,
            instance_id: document.require_str(INSTANCE_ID_KEY)?.to_string(),
            version_counter: document.require_i64(COUNTER_KEY)?,
        })
    }
}

/// Version information about one document, local or remote.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentVersionInfo {
    version: Option<Version>,
    version_doc: Option<Document>,
    filter: Option<Document>,
}

impl DocumentVersionInfo {
    fn build(version_doc: Option<&Document>, document_id: Option<&Value>) -> ProtocolResult<Self> {
        let version = version_doc.map(Version::from_document).transpose()?;
        let filter = document_id.map(|id| versioned_filter(id, version_doc));
        Ok(Self {
            version,
            version_doc: version_doc.cloned(),
            filter,
        })
    }

    /// Version info of a document fetched from the remote side.
    ///
    /// Returns `Ok(None)` when the document carries no version at all.
    pub fn from_remote_document(document: &Document) -> ProtocolResult<Option<Self>> {
        match version_document_of(document)? {
            Some(version_doc) => Self::build(Some(version_doc), document.get(ID_FIELD)).map(Some),
            None => Ok(None),
        }
    }

    /// Version info from a bare version document. Has no filter.
    pub fn from_version_document(version_doc: Option<&Document>) -> ProtocolResult<Self> {
        Self::build(version_doc, None)
    }

    /// Version info for a locally tracked document, given the last version
    /// the engine saw on the remote side.
    pub fn local(document_id: &Value, last_known_remote: Option<&Document>) -> ProtocolResult<Self> {
        Self::build(last_known_remote, Some(document_id))
    }

    /// The decoded version, if any.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// The raw version document, if any.
    pub fn version_document(&self) -> Option<&Document> {
        self.version_doc.as_ref()
    }

    /// True when a version is known.
    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    /// Filter matching the document only at this version.
    ///
    /// Without a version, matches only documents that have no version field.
    pub fn filter(&self) -> Option<&Document> {
        self.filter.as_ref()
    }

    /// The version to write next: counter plus one, or a fresh instance when
    /// no version is known.
    pub fn next_version(&self) -> Version {
        match &self.version {
            Some(v) => v.next(),
            None => Version::fresh(),
        }
    }
}

fn versioned_filter(document_id: &Value, version_doc: Option<&Document>) -> Document {
    let mut filter = Document::with_capacity(2);
    filter.insert(ID_FIELD, document_id.clone());
    match version_doc {
        Some(v) => filter.insert(DOCUMENT_VERSION_FIELD, v.clone()),
        None => filter.insert(DOCUMENT_VERSION_FIELD, doc! { "$exists" => false }),
    };
    filter
}

/// The version document embedded in `document`.
///
/// A version field holding anything other than a document is an error.
pub fn version_document_of(document: &Document) -> ProtocolResult<Option<&Document>> {
    match document.get(DOCUMENT_VERSION_FIELD) {
        None => Ok(None),
        Some(Value::Document(v)) => Ok(Some(v)),
        Some(other) => Err(ProtocolError::decoding(format!(
            "{DOCUMENT_VERSION_FIELD} must be a document, found {}",
            other.type_name()
        ))),
    }
}

/// Copy of `document` without the version field.
pub fn sanitize_document(document: &Document) -> Document {
    let mut sanitized = document.clone();
    sanitized.remove(DOCUMENT_VERSION_FIELD);
    sanitized
}

/// Copy of `document` carrying `version`.
pub fn with_version(document: &Document, version: &Version) -> Document {
    let mut versioned = document.clone();
    versioned.insert(DOCUMENT_VERSION_FIELD, version.to_document());
    versioned
}

/// `{$set: {__stitch_sync_version: version}}`.
pub fn version_update_document(version: &Version) -> Document {
    doc! { "$set" => doc! { DOCUMENT_VERSION_FIELD => version.to_document() } }
}
