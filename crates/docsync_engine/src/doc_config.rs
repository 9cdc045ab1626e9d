//! Per-document synchronization bookkeeping.

use std::fmt;

use docsync_codec::{doc, Document, Value};
use docsync_protocol::{
    ChangeEvent, CompactChangeEvent, DocumentVersionInfo, MongoNamespace, OperationType, ProtocolResult,
    Version,
};

use crate::error::{SyncError, SyncResult};
use crate::instance_config::ConfigStore;

/// Schema version written with every document record.
pub const DOCUMENT_SCHEMA_VERSION: i64 = 1;

/// Where a document stands in the synchronization lifecycle.
///
/// A conflict is resolved within the pass that detects it, so there is no
/// observable conflicted state: the document either returns to `Synced`,
/// keeps a resolved write pending, or is `Paused` when the handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentState {
    /// The id is not being synchronized.
    NotTracked,
    /// Local and remote agree as of the last pass.
    Synced,
    /// A local write has not been acknowledged by the remote yet.
    PendingLocalWrite,
    /// Excluded from passes until resumed or written locally.
    Paused,
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentState::NotTracked => "not_tracked",
            DocumentState::Synced => "synced",
            DocumentState::PendingLocalWrite => "pending_local_write",
            DocumentState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one synchronized document.
///
/// Records the last uncommitted local change, the remote version and content
/// hash last agreed on, and the stale and paused flags. Persisted in the
/// `documents` collection of the instance's config database.
#[derive(Debug, Clone)]
pub struct DocumentSynchronization {
    namespace: MongoNamespace,
    document_id: Value,
    uncommitted_change_event: Option<ChangeEvent>,
    last_resolution: i64,
    last_known_remote_version: Option<Document>,
    last_known_hash: i64,
    is_stale: bool,
    is_paused: bool,
    // Bumped by every application-side change; never persisted.
    generation: u64,
    // Set while a pass pushes the pending write; never persisted.
    push_in_flight: bool,
}

impl DocumentSynchronization {
    /// Starts tracking `document_id` with no pending write and no version.
    pub fn new(namespace: MongoNamespace, document_id: Value) -> Self {
        Self {
            namespace,
            document_id,
            uncommitted_change_event: None,
            last_resolution: 0,
            last_known_remote_version: None,
            last_known_hash: 0,
            is_stale: false,
            is_paused: false,
            generation: 0,
            push_in_flight: false,
        }
    }

    /// Namespace of the document.
    pub fn namespace(&self) -> &MongoNamespace {
        &self.namespace
    }

    /// `_id` of the document.
    pub fn document_id(&self) -> &Value {
        &self.document_id
    }

    /// The coalesced local change not yet acknowledged remotely.
    pub fn uncommitted_change_event(&self) -> Option<&ChangeEvent> {
        self.uncommitted_change_event.as_ref()
    }

    /// True while a local write is pending.
    pub fn has_uncommitted_writes(&self) -> bool {
        self.uncommitted_change_event.is_some()
    }

    /// Logical time of the last local write or conflict resolution.
    pub fn last_resolution(&self) -> i64 {
        self.last_resolution
    }

    /// Version document last seen on the remote side.
    pub fn last_known_remote_version(&self) -> Option<&Document> {
        self.last_known_remote_version.as_ref()
    }

    /// Content hash of the document as last agreed.
    pub fn last_known_hash(&self) -> i64 {
        self.last_known_hash
    }

    /// True when the local copy must be checked against the remote.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// True when the document is excluded from passes.
    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// Lifecycle state.
    pub fn state(&self) -> DocumentState {
        if self.is_paused {
            DocumentState::Paused
        } else if self.uncommitted_change_event.is_some() {
            DocumentState::PendingLocalWrite
        } else {
            DocumentState::Synced
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Marks an application-side change so that in-flight pass results for
    /// this document are discarded.
    pub(crate) fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// True while a pass may be sending the pending write to the remote.
    ///
    /// An insert in flight may already exist remotely, so deleting it
    /// locally must still be pushed.
    pub(crate) fn push_in_flight(&self) -> bool {
        self.push_in_flight
    }

    pub(crate) fn set_push_in_flight(&mut self, in_flight: bool) {
        self.push_in_flight = in_flight;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.is_stale = stale;
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.is_paused = paused;
    }

    /// Version information for versioned remote writes.
    pub fn version_info(&self) -> ProtocolResult<DocumentVersionInfo> {
        DocumentVersionInfo::local(&self.document_id, self.last_known_remote_version.as_ref())
    }

    /// Records a local write, coalescing it with any pending one, and
    /// persists the record.
    ///
    /// A paused document is resumed and marked stale, since the local write
    /// makes its last known state meaningless.
    pub(crate) fn set_some_pending_writes_and_save(
        &mut self,
        config: &ConfigStore,
        at_time: i64,
        change_event: ChangeEvent,
    ) -> SyncResult<()> {
        if self.is_paused {
            self.is_paused = false;
            self.is_stale = true;
        }
        let coalesced = coalesce_change_events(self.uncommitted_change_event.as_ref(), change_event);
        self.uncommitted_change_event = Some(coalesced);
        self.last_resolution = at_time;
        self.touch();
        config.save_document(self)
    }

    /// Records a pending write chosen by conflict resolution, together with
    /// the remote version and hash it was resolved against.
    pub(crate) fn set_some_pending_writes(
        &mut self,
        at_time: i64,
        at_version: Option<Document>,
        at_hash: i64,
        change_event: ChangeEvent,
    ) {
        self.uncommitted_change_event = Some(change_event);
        self.last_known_remote_version = at_version;
        self.last_known_hash = at_hash;
        self.last_resolution = at_time;
    }

    /// Clears the pending write after local and remote agree.
    pub(crate) fn set_pending_writes_complete(&mut self, at_hash: i64, at_version: Option<Document>) {
        self.uncommitted_change_event = None;
        self.last_known_remote_version = at_version;
        self.last_known_hash = at_hash;
    }

    /// Forgets the agreed content hash, so the remote copy compares as
    /// changed on the next check.
    pub(crate) fn forget_hash(&mut self) {
        self.last_known_hash = 0;
    }

    /// Records a remote acknowledgement while keeping a newer pending write.
    ///
    /// The pending write is rewritten against the acknowledged remote state:
    /// an insert becomes a replace once the document exists remotely, and a
    /// replace or update becomes an insert once it has been deleted there.
    pub(crate) fn acknowledge_remote_write(
        &mut self,
        at_hash: i64,
        at_version: Option<Document>,
        remote_exists: bool,
    ) {
        self.last_known_remote_version = at_version;
        self.last_known_hash = at_hash;
        if let Some(pending) = self.uncommitted_change_event.as_mut() {
            pending.operation_type = match (pending.operation_type, remote_exists) {
                (OperationType::Insert, true) => OperationType::Replace,
                (OperationType::Replace | OperationType::Update, false) if pending.full_document.is_some() => {
                    OperationType::Insert
                }
                (op, _) => op,
            };
            if pending.operation_type != OperationType::Update {
                pending.update_description = None;
            }
        }
    }

    /// Persisted `_id` of this record.
    pub fn record_id(&self) -> Document {
        record_id(&self.namespace, &self.document_id)
    }

    /// Encodes the record for the config database.
    pub fn to_document(&self) -> Document {
        let mut document = Document::with_capacity(10);
        document.insert("_id", self.record_id());
        document.insert("namespace", self.namespace.to_document());
        document.insert("document_id", self.document_id.clone());
        document.insert("schema_version", DOCUMENT_SCHEMA_VERSION);
        document.insert("last_resolution", self.last_resolution);
        if let Some(version) = &self.last_known_remote_version {
            document.insert("last_known_remote_version", version.clone());
        }
        document.insert("last_known_hash", self.last_known_hash);
        if let Some(event) = &self.uncommitted_change_event {
            let version = self
                .last_known_remote_version
                .as_ref()
                .and_then(|v| Version::from_document(v).ok());
            document.insert(
                "last_uncommitted_change_event",
                event.to_compact(self.last_known_hash, version).to_document(),
            );
        }
        document.insert("is_stale", self.is_stale);
        document.insert("is_paused", self.is_paused);
        document
    }

    /// Decodes a record written by [`DocumentSynchronization::to_document`].
    pub fn from_document(document: &Document) -> SyncResult<Self> {
        let schema_version = document.require_i64("schema_version")?;
        if schema_version != DOCUMENT_SCHEMA_VERSION {
            return Err(SyncError::decoding(format!(
                "unsupported document config schema version {schema_version}"
            )));
        }
        let namespace = MongoNamespace::from_document(document.require_document("namespace")?)?;
        let document_id = document
            .get("document_id")
            .cloned()
            .ok_or_else(|| SyncError::decoding("document config is missing document_id"))?;
        let last_known_remote_version = match document.get("last_known_remote_version") {
            None | Some(Value::Null) => None,
            Some(Value::Document(v)) => Some(v.clone()),
            Some(other) => {
                return Err(SyncError::decoding(format!(
                    "last_known_remote_version must be a document, found {}",
                    other.type_name()
                )))
            }
        };
        let uncommitted_change_event = match document.get("last_uncommitted_change_event") {
            None | Some(Value::Null) => None,
            Some(Value::Document(compact)) => Some(expand_compact(
                &namespace,
                CompactChangeEvent::from_document(compact)?,
            )),
            Some(other) => {
                return Err(SyncError::decoding(format!(
                    "last_uncommitted_change_event must be a document, found {}",
                    other.type_name()
                )))
            }
        };
        Ok(Self {
            namespace,
            document_id,
            uncommitted_change_event,
            last_resolution: document.get_i64("last_resolution").unwrap_or(0),
            last_known_remote_version,
            last_known_hash: document.get_i64("last_known_hash").unwrap_or(0),
            is_stale: document.get_bool("is_stale").unwrap_or(false),
            is_paused: document.get_bool("is_paused").unwrap_or(false),
            generation: 0,
            push_in_flight: false,
        })
    }
}

/// `{ns: "db.coll", id: <_id>}`.
pub(crate) fn record_id(namespace: &MongoNamespace, document_id: &Value) -> Document {
    doc! { "ns" => namespace.to_string(), "id" => document_id.clone() }
}

fn expand_compact(namespace: &MongoNamespace, compact: CompactChangeEvent) -> ChangeEvent {
    ChangeEvent {
        id: Document::new(),
        operation_type: compact.operation_type,
        full_document: compact.full_document,
        namespace: namespace.clone(),
        document_key: compact.document_key,
        update_description: compact.update_description,
        has_uncommitted_writes: compact.has_uncommitted_writes,
    }
}

/// Folds `newest` into the pending change `last`.
///
/// - insert then update or replace stays an insert of the newest document
/// - delete then insert becomes a replace
/// - update then update merges the descriptions, or becomes a replace when
///   their paths overlap
/// - replace then update stays a replace of the newest document
///
/// Every other combination keeps only `newest`.
pub fn coalesce_change_events(last: Option<&ChangeEvent>, newest: ChangeEvent) -> ChangeEvent {
    let Some(last) = last else {
        return newest;
    };
    match (last.operation_type, newest.operation_type) {
        (OperationType::Insert, OperationType::Update | OperationType::Replace) => ChangeEvent {
            operation_type: OperationType::Insert,
            update_description: None,
            ..newest
        },
        (OperationType::Delete, OperationType::Insert) => ChangeEvent {
            operation_type: OperationType::Replace,
            update_description: None,
            ..newest
        },
        (OperationType::Update, OperationType::Update) => {
            let merged = match (&last.update_description, &newest.update_description) {
                (Some(earlier), Some(later)) => earlier.merge(later),
                _ => None,
            };
            match merged {
                Some(description) => ChangeEvent {
                    update_description: Some(description),
                    ..newest
                },
                None => ChangeEvent {
                    operation_type: OperationType::Replace,
                    update_description: None,
                    ..newest
                },
            }
        }
        (OperationType::Replace, OperationType::Update) => ChangeEvent {
            operation_type: OperationType::Replace,
            update_description: None,
            ..newest
        },
        _ => newest,
    }
}
