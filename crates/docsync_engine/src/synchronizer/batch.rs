//! Staged per-document effects of a sync pass.
//!
//! Passes decide what to do with a document from a snapshot of its
//! bookkeeping, then stage the local write, bookkeeping change, remote
//! follow-ups and notifications in a [`DocumentBatch`]. The batch is
//! committed under the engine lock; remote calls and callbacks run from the
//! returned [`Outbox`] after the lock is released.

use std::sync::Arc;

use docsync_codec::{doc, document_hash, Document, Value};
use docsync_protocol::{sanitize_document, ChangeEvent, MongoNamespace, ID_FIELD};
use tracing::{debug, warn};

use super::{forget_document, save_tracked, EngineState};
use crate::delegate::{dispatch_error, dispatch_event, ChangeEventListener, ErrorListener};
use crate::doc_config::DocumentSynchronization;
use crate::error::{SyncError, SyncResult};
use crate::instance_config::local_user_database;
use crate::remote::RemoteCollection;
use crate::undo::UndoJournal;

/// Local write staged for one document.
#[derive(Debug, Clone)]
pub(crate) enum LocalWrite {
    Upsert(Document),
    Delete,
}

/// What happens to the live bookkeeping on commit.
#[derive(Debug, Clone)]
enum ConfigChange {
    Unchanged,
    /// Replace the live record with the batch's working copy.
    Save,
    /// Stop synchronizing the document.
    Desync,
    /// The remote acknowledged a pending write.
    Acknowledged {
        hash: i64,
        version: Option<Document>,
        remote_exists: bool,
    },
}

#[derive(Debug, Clone)]
struct RemoteWrite {
    document_id: Value,
    filter: Document,
    update: Document,
}

/// Effects on one document, decided outside the engine lock.
#[derive(Debug)]
pub(crate) struct DocumentBatch {
    pub(crate) namespace: MongoNamespace,
    pub(crate) document_id: Value,
    /// Working copy of the bookkeeping.
    pub(crate) config: DocumentSynchronization,
    generation: u64,
    change: ConfigChange,
    local_write: Option<LocalWrite>,
    remote_writes: Vec<RemoteWrite>,
    events: Vec<ChangeEvent>,
    errors: Vec<SyncError>,
}

impl DocumentBatch {
    pub(crate) fn new(mut config: DocumentSynchronization) -> Self {
        config.set_push_in_flight(false);
        Self {
            namespace: config.namespace().clone(),
            document_id: config.document_id().clone(),
            generation: config.generation(),
            config,
            change: ConfigChange::Unchanged,
            local_write: None,
            remote_writes: Vec::new(),
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Keeps the working copy on commit.
    pub(crate) fn save(&mut self) {
        if matches!(self.change, ConfigChange::Unchanged) {
            self.change = ConfigChange::Save;
        }
    }

    pub(crate) fn desync(&mut self) {
        self.change = ConfigChange::Desync;
    }

    pub(crate) fn acknowledge(&mut self, hash: i64, version: Option<Document>, remote_exists: bool) {
        self.change = ConfigChange::Acknowledged {
            hash,
            version,
            remote_exists,
        };
    }

    pub(crate) fn pause(&mut self) {
        self.config.set_paused(true);
        self.save();
    }

    pub(crate) fn upsert_local(&mut self, document: Document) {
        self.local_write = Some(LocalWrite::Upsert(document));
    }

    pub(crate) fn delete_local(&mut self) {
        self.local_write = Some(LocalWrite::Delete);
    }

    /// Queues a remote `updateOne` sent after commit.
    pub(crate) fn push_remote_update(&mut self, filter: Document, update: Document) {
        self.remote_writes.push(RemoteWrite {
            document_id: self.document_id.clone(),
            filter,
            update,
        });
    }

    pub(crate) fn emit(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub(crate) fn report(&mut self, error: SyncError) {
        self.errors.push(error);
    }

    #[cfg(test)]
    pub(crate) fn desyncs(&self) -> bool {
        matches!(self.change, ConfigChange::Desync)
    }

    #[cfg(test)]
    pub(crate) fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Adopts the remote document at `version`, clearing any pending write.
    pub(crate) fn replace_from_remote(&mut self, full_document: &Document, version: Option<Document>) {
        let sanitized = sanitize_document(full_document);
        self.config
            .set_pending_writes_complete(document_hash(&sanitized), version);
        self.emit(ChangeEvent::for_local_replace(
            &self.namespace,
            &self.document_id,
            &sanitized,
            false,
        ));
        self.upsert_local(sanitized);
        self.save();
    }

    /// Applies a remote delete and stops synchronizing the document.
    pub(crate) fn delete_from_remote(&mut self) {
        self.delete_local();
        self.desync();
        self.emit(ChangeEvent::for_local_delete(
            &self.namespace,
            &self.document_id,
            false,
        ));
    }

    /// Applies the batch to the live state.
    ///
    /// When the document changed since the batch was started, only a remote
    /// acknowledgement is kept and the document is marked stale otherwise;
    /// nothing is written locally and nothing is emitted. If the bookkeeping
    /// cannot be saved, the local write is rolled back.
    pub(crate) fn commit(self, state: &mut EngineState) -> SyncResult<Outbox> {
        let EngineState {
            store,
            config_store,
            instance,
        } = state;
        let Some(ns_config) = instance.get_mut(&self.namespace) else {
            return Ok(Outbox::default());
        };
        let listener = ns_config.change_event_listener();
        let Some(live) = ns_config.get_mut(&self.document_id) else {
            debug!(ns = %self.namespace, document_id = %self.document_id, "document desynced during pass");
            return Ok(Outbox::default());
        };
        live.set_push_in_flight(false);

        if live.generation() != self.generation {
            match self.change {
                ConfigChange::Acknowledged {
                    hash,
                    version,
                    remote_exists,
                } => live.acknowledge_remote_write(hash, version, remote_exists),
                _ => live.set_stale(true),
            }
            config_store.save_document(live)?;
            debug!(
                ns = %self.namespace,
                document_id = %self.document_id,
                "document changed during pass; deferring to next pass"
            );
            return Ok(Outbox::default());
        }
        let snapshot = live.clone();

        let journal = UndoJournal::new(store.clone(), self.namespace.clone());
        let user_database = local_user_database(&self.namespace);
        let collection = &self.namespace.collection;
        let filter = doc! { ID_FIELD => self.document_id.clone() };
        let mut rollback = None;
        if let Some(write) = &self.local_write {
            let prior = store.find_by_id(&user_database, collection, &self.document_id)?;
            journal.begin_undo(&self.document_id, prior.as_ref())?;
            let written = match write {
                LocalWrite::Upsert(document) => store
                    .replace_one(&user_database, collection, &filter, document, true)
                    .map(|_| ()),
                LocalWrite::Delete => store.delete_one(&user_database, collection, &filter).map(|_| ()),
            };
            if let Err(e) = written {
                journal.commit_undo(&self.document_id)?;
                return Err(e.into());
            }
            rollback = Some(prior);
        }

        let applied = match self.change {
            ConfigChange::Unchanged => Ok(()),
            ConfigChange::Save => {
                ns_config.insert(self.config);
                save_tracked(ns_config, config_store, &self.document_id)
            }
            ConfigChange::Desync => forget_document(ns_config, config_store, &self.document_id),
            ConfigChange::Acknowledged {
                hash,
                version,
                remote_exists: true,
            } => {
                if let Some(live) = ns_config.get_mut(&self.document_id) {
                    live.set_pending_writes_complete(hash, version);
                }
                save_tracked(ns_config, config_store, &self.document_id)
            }
            ConfigChange::Acknowledged {
                remote_exists: false,
                ..
            } => forget_document(ns_config, config_store, &self.document_id),
        };
        if let Err(e) = applied {
            ns_config.insert(snapshot);
            if let Some(prior) = &rollback {
                journal.roll_back(&self.document_id, prior.as_ref());
            }
            return Err(e);
        }

        if rollback.is_some() {
            journal.commit_undo(&self.document_id)?;
        }

        Ok(Outbox {
            listener,
            remote_writes: self.remote_writes,
            events: self.events,
            errors: self
                .errors
                .into_iter()
                .map(|e| (e, Some(self.document_id.clone())))
                .collect(),
        })
    }
}

/// Work left after a commit, run without holding the engine lock.
#[derive(Default)]
pub(crate) struct Outbox {
    listener: Option<Arc<dyn ChangeEventListener>>,
    remote_writes: Vec<RemoteWrite>,
    events: Vec<ChangeEvent>,
    errors: Vec<(SyncError, Option<Value>)>,
}

impl Outbox {
    pub(crate) fn with_events(
        listener: Option<Arc<dyn ChangeEventListener>>,
        events: Vec<ChangeEvent>,
    ) -> Self {
        Self {
            listener,
            events,
            ..Self::default()
        }
    }

    /// Sends remote follow-ups, then delivers events and errors.
    pub(crate) fn flush(self, remote: Option<&RemoteCollection>, error_listener: Option<&dyn ErrorListener>) {
        let mut errors = self.errors;
        if let Some(remote) = remote {
            for write in self.remote_writes {
                if let Err(e) = remote.update_one(&write.filter, &write.update, false) {
                    warn!(
                        ns = %remote.namespace(),
                        document_id = %write.document_id,
                        error = %e,
                        "failed to update remote version"
                    );
                    errors.push((e, Some(write.document_id)));
                }
            }
        }
        if let Some(listener) = self.listener.as_deref() {
            for event in &self.events {
                dispatch_event(listener, event);
            }
        }
        for (error, document_id) in &errors {
            warn!(document_id = ?document_id.as_ref().map(ToString::to_string), error = %error, "sync error");
            if let Some(listener) = error_listener {
                dispatch_error(listener, error, document_id.as_ref());
            }
        }
    }
}
