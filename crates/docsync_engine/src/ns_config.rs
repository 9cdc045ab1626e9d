//! Per-namespace synchronization bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use docsync_codec::{Document, Value};
use docsync_protocol::{ConflictHandler, MongoNamespace};

use crate::delegate::ChangeEventListener;
use crate::doc_config::DocumentSynchronization;
use crate::error::{SyncError, SyncResult};

/// Schema version written with every namespace record.
pub const NAMESPACE_SCHEMA_VERSION: i64 = 1;

/// The synchronized documents of one namespace, its change-stream resume
/// token, and the handlers registered for it.
///
/// Handlers live only in memory; they must be registered again with
/// `configure` after a restart.
pub struct NamespaceSynchronization {
    namespace: MongoNamespace,
    documents: HashMap<Value, DocumentSynchronization>,
    resume_token: Option<Value>,
    conflict_handler: Option<Arc<dyn ConflictHandler<Document>>>,
    change_event_listener: Option<Arc<dyn ChangeEventListener>>,
}

impl fmt::Debug for NamespaceSynchronization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceSynchronization")
            .field("namespace", &self.namespace)
            .field("documents", &self.documents.len())
            .field("resume_token", &self.resume_token)
            .field("configured", &self.conflict_handler.is_some())
            .finish()
    }
}

impl NamespaceSynchronization {
    /// An empty, unconfigured namespace.
    pub fn new(namespace: MongoNamespace) -> Self {
        Self {
            namespace,
            documents: HashMap::new(),
            resume_token: None,
            conflict_handler: None,
            change_event_listener: None,
        }
    }

    /// The namespace.
    pub fn namespace(&self) -> &MongoNamespace {
        &self.namespace
    }

    /// True once a conflict handler has been registered.
    pub fn is_configured(&self) -> bool {
        self.conflict_handler.is_some()
    }

    pub(crate) fn configure(
        &mut self,
        conflict_handler: Arc<dyn ConflictHandler<Document>>,
        change_event_listener: Option<Arc<dyn ChangeEventListener>>,
    ) {
        self.conflict_handler = Some(conflict_handler);
        self.change_event_listener = change_event_listener;
    }

    pub(crate) fn conflict_handler(&self) -> Option<Arc<dyn ConflictHandler<Document>>> {
        self.conflict_handler.clone()
    }

    pub(crate) fn change_event_listener(&self) -> Option<Arc<dyn ChangeEventListener>> {
        self.change_event_listener.clone()
    }

    /// Bookkeeping for `document_id`, if it is synchronized.
    pub fn get(&self, document_id: &Value) -> Option<&DocumentSynchronization> {
        self.documents.get(document_id)
    }

    pub(crate) fn get_mut(&mut self, document_id: &Value) -> Option<&mut DocumentSynchronization> {
        self.documents.get_mut(document_id)
    }

    /// Starts synchronizing `document_id`.
    ///
    /// Returns the bookkeeping and whether it was newly created. New
    /// documents are stale so the next pass fetches their remote state.
    pub(crate) fn sync_document(&mut self, document_id: &Value) -> (&mut DocumentSynchronization, bool) {
        let mut created = false;
        let namespace = &self.namespace;
        let config = self.documents.entry(document_id.clone()).or_insert_with(|| {
            created = true;
            let mut config = DocumentSynchronization::new(namespace.clone(), document_id.clone());
            config.set_stale(true);
            config
        });
        (config, created)
    }

    pub(crate) fn insert(&mut self, config: DocumentSynchronization) {
        self.documents.insert(config.document_id().clone(), config);
    }

    pub(crate) fn remove(&mut self, document_id: &Value) -> Option<DocumentSynchronization> {
        self.documents.remove(document_id)
    }

    /// Every synchronized document.
    pub fn documents(&self) -> impl Iterator<Item = &DocumentSynchronization> {
        self.documents.values()
    }

    /// Number of synchronized documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when nothing is synchronized.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// `_id`s of every synchronized document.
    pub fn synced_ids(&self) -> Vec<Value> {
        self.documents.keys().cloned().collect()
    }

    /// `_id`s of paused documents.
    pub fn paused_ids(&self) -> Vec<Value> {
        self.documents
            .values()
            .filter(|d| d.is_paused())
            .map(|d| d.document_id().clone())
            .collect()
    }

    /// `_id`s of documents that must be re-fetched.
    pub fn stale_ids(&self) -> Vec<Value> {
        self.documents
            .values()
            .filter(|d| d.is_stale())
            .map(|d| d.document_id().clone())
            .collect()
    }

    /// Marks every document stale.
    pub(crate) fn mark_all_stale(&mut self) {
        for config in self.documents.values_mut() {
            config.set_stale(true);
        }
    }

    /// Change-stream position, if a stream has been opened.
    pub fn resume_token(&self) -> Option<&Value> {
        self.resume_token.as_ref()
    }

    pub(crate) fn set_resume_token(&mut self, token: Option<Value>) {
        self.resume_token = token;
    }

    /// Encodes the namespace record (documents are stored separately).
    pub fn to_document(&self) -> Document {
        let mut document = Document::with_capacity(4);
        document.insert("_id", self.namespace.to_string());
        document.insert("namespace", self.namespace.to_document());
        document.insert("schema_version", NAMESPACE_SCHEMA_VERSION);
        document.insert("resume_token", self.resume_token.clone().unwrap_or(Value::Null));
        document
    }

    /// Decodes a namespace record with no documents attached.
    pub fn from_document(document: &Document) -> SyncResult<Self> {
        let schema_version = document.require_i64("schema_version")?;
        if schema_version != NAMESPACE_SCHEMA_VERSION {
            return Err(SyncError::decoding(format!(
                "unsupported namespace config schema version {schema_version}"
            )));
        }
        let namespace = MongoNamespace::from_document(document.require_document("namespace")?)?;
        let mut config = Self::new(namespace);
        config.resume_token = match document.get("resume_token") {
            None | Some(Value::Null) => None,
            Some(token) => Some(token.clone()),
        };
        Ok(config)
    }
}
