//! Conflict resolution.

use std::panic::{catch_unwind, AssertUnwindSafe};

use docsync_codec::{document_hash, Document};
use docsync_protocol::{
    sanitize_document, version_document_of, ChangeEvent, OperationType, UpdateDescription, ID_FIELD,
};
use tracing::{debug, warn};

use super::batch::DocumentBatch;
use super::NamespaceContext;
use crate::error::SyncError;

fn sanitized(event: &ChangeEvent) -> ChangeEvent {
    let mut event = event.clone();
    event.full_document = event.full_document.as_ref().map(sanitize_document);
    event
}

fn pause_unresolved(batch: &mut DocumentBatch, message: impl Into<String>) {
    let message = message.into();
    warn!(
        ns = %batch.namespace,
        document_id = %batch.document_id,
        reason = %message,
        "conflict unresolved; pausing document"
    );
    batch.report(SyncError::conflict_unresolved(&batch.document_id, message));
    batch.pause();
}

/// Resolves a conflict between the pending local write and `remote_event`
/// with the namespace's conflict handler, staging the outcome in `batch`.
///
/// Returns false when the handler failed and the document was paused.
pub(super) fn resolve_conflict(
    t: i64,
    ctx: &NamespaceContext,
    batch: &mut DocumentBatch,
    remote_event: &ChangeEvent,
) -> bool {
    let Some(local_event) = batch.config.uncommitted_change_event().cloned() else {
        // Nothing left to protect locally.
        match &remote_event.full_document {
            Some(full) => match version_document_of(full) {
                Ok(version) => batch.replace_from_remote(full, version.cloned()),
                Err(e) => {
                    batch.report(e.into());
                    batch.delete_local();
                    batch.desync();
                }
            },
            None => batch.delete_from_remote(),
        }
        return true;
    };

    debug!(
        t,
        ns = %ctx.namespace,
        document_id = %batch.document_id,
        local = %local_event.operation_type,
        remote = %remote_event.operation_type,
        "resolving conflict"
    );
    let local_view = sanitized(&local_event);
    let remote_view = sanitized(remote_event);
    let handler = ctx.conflict_handler.as_ref();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        handler.resolve_conflict(&batch.document_id, &local_view, &remote_view)
    }));
    let resolution = match outcome {
        Ok(Ok(resolution)) => resolution,
        Ok(Err(e)) => {
            pause_unresolved(batch, e.to_string());
            return false;
        }
        Err(_) => {
            pause_unresolved(batch, "conflict handler panicked");
            return false;
        }
    };

    let resolution = match resolution {
        Some(mut document) => {
            match document.get(ID_FIELD) {
                None => {
                    document.insert(ID_FIELD, batch.document_id.clone());
                }
                Some(id) if id != &batch.document_id => {
                    pause_unresolved(batch, format!("resolved document has a different _id: {id}"));
                    return false;
                }
                Some(_) => {}
            }
            Some(sanitize_document(&document))
        }
        None => None,
    };

    let remote_deleted = remote_event.operation_type == OperationType::Delete;
    let remote_version = if remote_deleted {
        None
    } else {
        match remote_event.full_document.as_ref().map(version_document_of) {
            None => None,
            Some(Ok(version)) => version.cloned(),
            Some(Err(e)) => {
                batch.report(e.into());
                batch.delete_local();
                batch.desync();
                return true;
            }
        }
    };
    let remote_document: Option<Document> = remote_view.full_document;
    let accept_remote = match (&remote_document, &resolution) {
        (None, None) => true,
        (Some(remote), Some(resolved)) => remote == resolved,
        _ => false,
    };

    match (resolution, accept_remote) {
        (Some(_), true) => {
            if let Some(full) = &remote_event.full_document {
                batch.replace_from_remote(full, remote_version);
            }
        }
        (Some(resolved), false) => {
            let event = if remote_deleted {
                ChangeEvent::for_local_insert(&batch.namespace, &batch.document_id, &resolved, true)
            } else if let Some(remote) = &remote_document {
                ChangeEvent::for_local_update(
                    &batch.namespace,
                    &batch.document_id,
                    UpdateDescription::diff(remote, &resolved),
                    &resolved,
                    true,
                )
            } else {
                ChangeEvent::for_local_replace(&batch.namespace, &batch.document_id, &resolved, true)
            };
            batch
                .config
                .set_some_pending_writes(t, remote_version, document_hash(&resolved), event.clone());
            batch.upsert_local(resolved);
            batch.emit(event);
            batch.save();
        }
        (None, true) => batch.delete_from_remote(),
        (None, false) => {
            let event = ChangeEvent::for_local_delete(&batch.namespace, &batch.document_id, true);
            batch.config.set_some_pending_writes(t, remote_version, 0, event.clone());
            batch.delete_local();
            batch.emit(event);
            batch.save();
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docsync_codec::{doc, Value};
    use docsync_protocol::{
        with_version, ConflictHandler, LocalWins, MongoNamespace, ProtocolError, RemoteWins, Version,
    };

    use crate::doc_config::DocumentSynchronization;
    use crate::mock::MockRemoteService;

    fn ns() -> MongoNamespace {
        MongoNamespace::new("db", "c")
    }

    fn context(handler: Arc<dyn ConflictHandler<Document>>) -> NamespaceContext {
        NamespaceContext {
            namespace: ns(),
            remote: Arc::new(MockRemoteService::new()).collection(ns()),
            conflict_handler: handler,
        }
    }

    fn pending_batch(local: &Document, version: &Version) -> DocumentBatch {
        let mut config = DocumentSynchronization::new(ns(), Value::from(1));
        config.set_some_pending_writes(
            1,
            Some(version.to_document()),
            document_hash(&doc! { "_id" => 1, "a" => 0 }),
            ChangeEvent::for_local_replace(&ns(), &Value::from(1), local, true),
        );
        DocumentBatch::new(config)
    }

    #[test]
    fn remote_wins_clears_pending_write() {
        let v = Version::fresh().next();
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &v);
        let remote = ChangeEvent::for_local_replace(&ns(), &Value::from(1), &with_version(&doc! { "_id" => 1, "a" => 2 }, &v), false);
        assert!(resolve_conflict(2, &context(Arc::new(RemoteWins)), &mut batch, &remote));
        assert!(!batch.config.has_uncommitted_writes());
        assert_eq!(batch.config.last_known_remote_version(), Some(&v.to_document()));
        assert_eq!(batch.config.last_known_hash(), document_hash(&doc! { "_id" => 1, "a" => 2 }));
    }

    #[test]
    fn local_wins_keeps_update_against_remote_version() {
        let v = Version::fresh();
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &v);
        let remote_version = v.next();
        let remote = ChangeEvent::for_local_replace(
            &ns(),
            &Value::from(1),
            &with_version(&doc! { "_id" => 1, "a" => 2 }, &remote_version),
            false,
        );
        assert!(resolve_conflict(5, &context(Arc::new(LocalWins)), &mut batch, &remote));
        let pending = batch.config.uncommitted_change_event().unwrap();
        assert_eq!(pending.operation_type, OperationType::Update);
        assert_eq!(
            pending.update_description.as_ref().unwrap().updated_fields,
            doc! { "a" => 1 }
        );
        assert_eq!(batch.config.last_resolution(), 5);
        assert_eq!(
            batch.config.last_known_remote_version(),
            Some(&remote_version.to_document())
        );
    }

    #[test]
    fn deleting_resolution_against_remote_delete_desyncs() {
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &Version::fresh());
        let remote = ChangeEvent::for_local_delete(&ns(), &Value::from(1), false);
        let delete_all = |_: &Value, _: &ChangeEvent, _: &ChangeEvent| -> Result<Option<Document>, ProtocolError> {
            Ok(None)
        };
        assert!(resolve_conflict(2, &context(Arc::new(delete_all)), &mut batch, &remote));
        assert!(batch.desyncs());
        assert!(!batch.events()[0].has_uncommitted_writes);
    }

    #[test]
    fn failing_handler_pauses() {
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &Version::fresh());
        let remote = ChangeEvent::for_local_delete(&ns(), &Value::from(1), false);
        let failing = |_: &Value, _: &ChangeEvent, _: &ChangeEvent| -> Result<Option<Document>, ProtocolError> {
            Err(ProtocolError::resolution("cannot decide"))
        };
        assert!(!resolve_conflict(2, &context(Arc::new(failing)), &mut batch, &remote));
        assert!(batch.config.is_paused());
    }

    #[test]
    fn resolution_with_other_id_pauses() {
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &Version::fresh());
        let remote = ChangeEvent::for_local_delete(&ns(), &Value::from(1), false);
        let wrong_id = |_: &Value, _: &ChangeEvent, _: &ChangeEvent| -> Result<Option<Document>, ProtocolError> {
            Ok(Some(doc! { "_id" => 2 }))
        };
        assert!(!resolve_conflict(2, &context(Arc::new(wrong_id)), &mut batch, &remote));
        assert!(batch.config.is_paused());
    }

    #[test]
    fn resolution_against_remote_delete_becomes_insert() {
        let mut batch = pending_batch(&doc! { "_id" => 1, "a" => 1 }, &Version::fresh());
        let remote = ChangeEvent::for_local_delete(&ns(), &Value::from(1), false);
        let recreate = |_: &Value, _: &ChangeEvent, _: &ChangeEvent| -> Result<Option<Document>, ProtocolError> {
            Ok(Some(doc! { "a" => 7 }))
        };
        assert!(resolve_conflict(2, &context(Arc::new(recreate)), &mut batch, &remote));
        let pending = batch.config.uncommitted_change_event().unwrap();
        assert_eq!(pending.operation_type, OperationType::Insert);
        assert_eq!(pending.full_document.as_ref().unwrap().get(ID_FIELD), Some(&Value::from(1)));
        assert_eq!(batch.config.last_known_remote_version(), None);
        assert!(batch.events()[0].has_uncommitted_writes);
    }
}
