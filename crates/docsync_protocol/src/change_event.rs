//! Change events.
//!
//! A [`ChangeEvent`] describes one observed mutation of one document. Remote
//! events come from the change stream; local events are synthesized by the
//! engine for writes made through a synchronized collection.

use std::hash::{Hash, Hasher};

use docsync_codec::{doc, Document, Value};

use crate::codec::DocumentCodec;
use crate::compact::CompactChangeEvent;
use crate::error::{ProtocolError, ProtocolResult};
use crate::namespace::MongoNamespace;
use crate::operation::OperationType;
use crate::update_description::UpdateDescription;
use crate::version::{sanitize_document, Version, ID_FIELD};

/// A single observed mutation.
///
/// Two events are equal when they target the same document key with the
/// same operation type and the same pending-write status; payloads are not
/// compared.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T = Document> {
    /// Event identifier (the change-stream token for remote events, empty
    /// for local ones).
    pub id: Document,
    /// Kind of mutation.
    pub operation_type: OperationType,
    /// Post-image for insert, replace and update; absent for delete.
    pub full_document: Option<T>,
    /// Namespace of the affected document.
    pub namespace: MongoNamespace,
    /// `{_id: ...}` of the affected document.
    pub document_key: Document,
    /// Changed fields, for `update` only.
    pub update_description: Option<UpdateDescription>,
    /// True while a local write has not been acknowledged remotely.
    pub has_uncommitted_writes: bool,
}

impl<T> PartialEq for ChangeEvent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.document_key == other.document_key
            && self.operation_type == other.operation_type
            && self.has_uncommitted_writes == other.has_uncommitted_writes
    }
}

impl<T> Eq for ChangeEvent<T> {}

impl<T> Hash for ChangeEvent<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.document_key.hash(state);
        self.operation_type.hash(state);
        self.has_uncommitted_writes.hash(state);
    }
}

impl<T> ChangeEvent<T> {
    /// The `_id` of the affected document.
    pub fn document_id(&self) -> Option<&Value> {
        self.document_key.get(ID_FIELD)
    }

    /// Copy of this event with `has_uncommitted_writes` cleared.
    #[must_use]
    pub fn without_uncommitted_writes(&self) -> Self
    where
        T: Clone,
    {
        let mut event = self.clone();
        event.has_uncommitted_writes = false;
        event
    }
}

fn document_key_for(document_id: &Value) -> Document {
    doc! { ID_FIELD => document_id.clone() }
}

impl ChangeEvent<Document> {
    /// Event for a local insert of `document` under `document_id`.
    ///
    /// The key always comes from `document_id`, whatever `_id` the payload
    /// carries.
    pub fn for_local_insert(
        namespace: &MongoNamespace,
        document_id: &Value,
        document: &Document,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation_type: OperationType::Insert,
            full_document: Some(document.clone()),
            namespace: namespace.clone(),
            document_key: document_key_for(document_id),
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    /// Event for a local field-level update.
    pub fn for_local_update(
        namespace: &MongoNamespace,
        document_id: &Value,
        update: UpdateDescription,
        full_document_after_update: &Document,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation_type: OperationType::Update,
            full_document: Some(full_document_after_update.clone()),
            namespace: namespace.clone(),
            document_key: document_key_for(document_id),
            update_description: Some(update),
            has_uncommitted_writes: write_pending,
        }
    }

    /// Event for a local whole-document replacement.
    pub fn for_local_replace(
        namespace: &MongoNamespace,
        document_id: &Value,
        document: &Document,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation_type: OperationType::Replace,
            full_document: Some(document.clone()),
            namespace: namespace.clone(),
            document_key: document_key_for(document_id),
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    /// Event for a local delete.
    pub fn for_local_delete(
        namespace: &MongoNamespace,
        document_id: &Value,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation_type: OperationType::Delete,
            full_document: None,
            namespace: namespace.clone(),
            document_key: document_key_for(document_id),
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    /// Re-decodes the full document into an application type.
    ///
    /// The version field is stripped before decoding.
    pub fn transform<U: DocumentCodec>(&self) -> ProtocolResult<ChangeEvent<U>> {
        let full_document = self
            .full_document
            .as_ref()
            .map(|d| U::from_document(&sanitize_document(d)))
            .transpose()?;
        Ok(ChangeEvent {
            id: self.id.clone(),
            operation_type: self.operation_type,
            full_document,
            namespace: self.namespace.clone(),
            document_key: self.document_key.clone(),
            update_description: self.update_description.clone(),
            has_uncommitted_writes: self.has_uncommitted_writes,
        })
    }

    /// Compact form carrying the given hash and version.
    pub fn to_compact(&self, hash: i64, version: Option<Version>) -> CompactChangeEvent {
        CompactChangeEvent {
            operation_type: self.operation_type,
            document_key: self.document_key.clone(),
            update_description: self.update_description.clone(),
            has_uncommitted_writes: self.has_uncommitted_writes,
            full_document: self.full_document.clone(),
            stitch_document_hash: hash,
            stitch_document_version: version,
        }
    }

    /// Encodes the full event.
    pub fn to_document(&self) -> Document {
        let mut document = Document::with_capacity(7);
        document.insert("_id", self.id.clone());
        document.insert("operationType", self.operation_type.as_str());
        if let Some(full) = &self.full_document {
            document.insert("fullDocument", full.clone());
        }
        document.insert("ns", self.namespace.to_document());
        document.insert("documentKey", self.document_key.clone());
        if let Some(update) = &self.update_description {
            document.insert("updateDescription", update.to_document());
        }
        document.insert("hasUncommittedWrites", self.has_uncommitted_writes);
        document
    }

    /// Decodes a full event.
    ///
    /// `_id`, `fullDocument`, `updateDescription` and `hasUncommittedWrites`
    /// are optional. Unrecognised operation types decode as
    /// [`OperationType::Unknown`].
    pub fn from_document(document: &Document) -> ProtocolResult<Self> {
        let id = optional_document(document, "_id")?.cloned().unwrap_or_default();
        let operation_type = OperationType::parse(document.require_str("operationType")?);
        let full_document = optional_document(document, "fullDocument")?.cloned();
        let namespace = MongoNamespace::from_document(document.require_document("ns")?)?;
        let document_key = document.require_document("documentKey")?.clone();
        let update_description = optional_document(document, "updateDescription")?
            .map(UpdateDescription::from_document)
            .transpose()?;
        let has_uncommitted_writes = optional_bool(document, "hasUncommittedWrites")?;
        Ok(Self {
            id,
            operation_type,
            full_document,
            namespace,
            document_key,
            update_description,
            has_uncommitted_writes,
        })
    }
}

/// Reads an optional embedded document; null counts as absent.
pub(crate) fn optional_document<'a>(
    document: &'a Document,
    key: &str,
) -> ProtocolResult<Option<&'a Document>> {
    match document.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Document(d)) => Ok(Some(d)),
        Some(other) => Err(ProtocolError::decoding(format!(
            "{key} must be a document, found {}",
            other.type_name()
        ))),
    }
}

/// Reads an optional boolean defaulting to false.
pub(crate) fn optional_bool(document: &Document, key: &str) -> ProtocolResult<bool> {
    match document.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(ProtocolError::decoding(format!(
            "{key} must be a bool, found {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{with_version, DOCUMENT_VERSION_FIELD};
    use docsync_codec::{CodecResult, ObjectId};
    use std::collections::HashSet;

    fn ns() -> MongoNamespace {
        MongoNamespace::new("db", "coll")
    }

    #[test]
    fn equality_ignores_payload() {
        let a = ChangeEvent::for_local_insert(&ns(), &Value::from(1), &doc! { "_id" => 1, "x" => 1 }, true);
        let b = ChangeEvent::for_local_insert(&ns(), &Value::from(1), &doc! { "_id" => 1, "x" => 2 }, true);
        assert_eq!(a, b);

        let c = ChangeEvent::for_local_insert(&ns(), &Value::from(1), &doc! { "_id" => 1, "x" => 1 }, false);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn insert_key_comes_from_explicit_id() {
        let event = ChangeEvent::for_local_insert(&ns(), &Value::from("k"), &doc! { "n" => 1 }, true);
        assert_eq!(event.document_key, doc! { "_id" => "k" });
        assert_eq!(event.full_document, Some(doc! { "n" => 1 }));
    }

    #[test]
    fn delete_has_no_full_document() {
        let e = ChangeEvent::for_local_delete(&ns(), &Value::from(7), true);
        assert!(e.full_document.is_none());
        assert_eq!(e.document_id(), Some(&Value::Int32(7)));
        assert!(!e.without_uncommitted_writes().has_uncommitted_writes);
    }

    #[test]
    fn document_roundtrip() {
        let id = Value::from(ObjectId::new());
        let event = ChangeEvent::for_local_update(
            &ns(),
            &id,
            UpdateDescription::new(doc! { "a" => 1 }, vec!["b".into()]),
            &doc! { "_id" => id.clone(), "a" => 1 },
            true,
        );
        let decoded = ChangeEvent::from_document(&event.to_document()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.update_description, event.update_description);
        assert_eq!(decoded.full_document, event.full_document);
        assert_eq!(decoded.namespace, ns());
    }

    #[test]
    fn unknown_operation_decodes() {
        let mut d = ChangeEvent::for_local_delete(&ns(), &Value::from(1), false).to_document();
        d.insert("operationType", "invalidate");
        d.remove("hasUncommittedWrites");
        let decoded = ChangeEvent::from_document(&d).unwrap();
        assert_eq!(decoded.operation_type, OperationType::Unknown);
        assert!(!decoded.has_uncommitted_writes);
    }

    #[derive(Debug)]
    struct Named {
        name: String,
    }

    impl DocumentCodec for Named {
        fn to_document(&self) -> CodecResult<Document> {
            Ok(doc! { "name" => self.name.as_str() })
        }

        fn from_document(document: &Document) -> CodecResult<Self> {
            if document.contains_key(DOCUMENT_VERSION_FIELD) {
                return Err(docsync_codec::CodecError::decoding_failed("unsanitized"));
            }
            Ok(Named {
                name: document.require_str("name")?.to_string(),
            })
        }
    }

    #[test]
    fn transform_sanitizes() {
        let stored = with_version(&doc! { "_id" => 1, "name" => "n" }, &Version::fresh());
        let event = ChangeEvent::for_local_replace(&ns(), &Value::from(1), &stored, false);
        let typed = event.transform::<Named>().unwrap();
        assert_eq!(typed.full_document.unwrap().name, "n");

        let bad = ChangeEvent::for_local_replace(&ns(), &Value::from(1), &doc! { "_id" => 1 }, false);
        assert!(bad.transform::<Named>().is_err());
    }
}
