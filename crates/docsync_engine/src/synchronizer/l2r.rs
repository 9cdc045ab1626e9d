//! Local-to-remote phase of a sync pass.

use docsync_codec::{doc, document_hash, Document, Value};
use docsync_protocol::{
    sanitize_document, with_version, ChangeEvent, OperationType, Version, DOCUMENT_VERSION_FIELD, ID_FIELD,
};
use tracing::debug;

use super::batch::DocumentBatch;
use super::{DataSynchronizer, NamespaceContext};
use crate::action::{log_decision, Decision, SyncAction, SyncMessage, L2R};
use crate::error::{SyncError, SyncResult};
use crate::stats::PassTally;

/// What happened to one pending write.
enum PushOutcome {
    /// The remote accepted the write; it now holds `version`.
    Pushed { hash: i64, version: Version },
    /// The remote document is gone.
    Deleted,
    /// The remote state differs from what the write assumed.
    Conflict(SyncMessage),
    /// The remote rejected the write.
    Rejected(SyncMessage, SyncError),
}

impl DataSynchronizer {
    pub(super) fn sync_local_to_remote(
        &self,
        t: i64,
        contexts: &[NamespaceContext],
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        for ctx in contexts {
            let pending: Vec<Value> = {
                let state = self.inner.state.lock();
                state
                    .instance
                    .get(&ctx.namespace)
                    .map(|ns| {
                        ns.documents()
                            .filter(|c| c.has_uncommitted_writes() && !c.is_paused())
                            .map(|c| c.document_id().clone())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for id in pending {
                self.check_cancelled()?;
                let Some(mut batch) = self.begin_push_batch(&ctx.namespace, &id) else {
                    continue;
                };
                if batch.config.is_paused() || !batch.config.has_uncommitted_writes() {
                    self.end_push(&ctx.namespace, &id);
                    continue;
                }
                if let Err(e) = self.push_local_write(t, ctx, &mut batch, tally) {
                    self.end_push(&ctx.namespace, &id);
                    return Err(e);
                }
                self.commit_batch(ctx, batch)?;
            }
        }
        Ok(())
    }

    fn push_local_write(
        &self,
        t: i64,
        ctx: &NamespaceContext,
        batch: &mut DocumentBatch,
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        let Some(local_event) = batch.config.uncommitted_change_event().cloned() else {
            return Ok(());
        };
        if batch.config.last_resolution() == t {
            log_decision(
                t,
                L2R,
                &ctx.namespace,
                &batch.document_id,
                &Decision::new(SyncAction::Wait, SyncMessage::SimultaneousWrites),
            );
            return Ok(());
        }
        let version_info = match batch.config.version_info() {
            Ok(info) => info,
            Err(e) => {
                batch.report(e.into());
                batch.pause();
                tally.documents_paused += 1;
                return Ok(());
            }
        };
        let filter = version_info
            .filter()
            .cloned()
            .unwrap_or_else(|| doc! { ID_FIELD => batch.document_id.clone() });
        let next_version = version_info.next_version();

        let outcome = match local_event.operation_type {
            OperationType::Insert => {
                let Some(full) = &local_event.full_document else {
                    missing_local_document(t, ctx, batch, tally);
                    return Ok(());
                };
                let sanitized = sanitize_document(full);
                let version = Version::fresh();
                match ctx.remote.insert_one(&with_version(&sanitized, &version)) {
                    Ok(_) => PushOutcome::Pushed {
                        hash: document_hash(&sanitized),
                        version,
                    },
                    Err(e) if e.is_duplicate_key() => PushOutcome::Conflict(SyncMessage::DuplicateKeyException),
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => PushOutcome::Rejected(SyncMessage::ExceptionOnInsert(e.to_string()), e),
                }
            }
            OperationType::Replace => {
                let Some(full) = &local_event.full_document else {
                    missing_local_document(t, ctx, batch, tally);
                    return Ok(());
                };
                let sanitized = sanitize_document(full);
                match ctx
                    .remote
                    .update_one(&filter, &with_version(&sanitized, &next_version), false)
                {
                    Ok(result) if result.matched_count == 0 => {
                        PushOutcome::Conflict(SyncMessage::VersionDifferentReplacedDoc)
                    }
                    Ok(_) => PushOutcome::Pushed {
                        hash: document_hash(&sanitized),
                        version: next_version,
                    },
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => PushOutcome::Rejected(SyncMessage::ExceptionOnReplace(e.to_string()), e),
                }
            }
            OperationType::Update => {
                let Some(description) = local_event.update_description.as_ref().filter(|d| !d.is_empty()) else {
                    log_decision(
                        t,
                        L2R,
                        &ctx.namespace,
                        &batch.document_id,
                        &Decision::new(SyncAction::DropEvent, SyncMessage::EmptyUpdateDescription),
                    );
                    let hash = batch.config.last_known_hash();
                    let version = batch.config.last_known_remote_version().cloned();
                    batch.config.set_pending_writes_complete(hash, version);
                    batch.save();
                    return Ok(());
                };
                let Some(full) = &local_event.full_document else {
                    missing_local_document(t, ctx, batch, tally);
                    return Ok(());
                };
                let mut update = description.as_update_document();
                let mut set = update.get_document("$set").cloned().unwrap_or_else(Document::new);
                set.insert(DOCUMENT_VERSION_FIELD, next_version.to_document());
                update.insert("$set", set);
                match ctx.remote.update_one(&filter, &update, false) {
                    Ok(result) if result.matched_count == 0 => {
                        PushOutcome::Conflict(SyncMessage::VersionDifferentUpdatedDoc)
                    }
                    Ok(_) => PushOutcome::Pushed {
                        hash: document_hash(&sanitize_document(full)),
                        version: next_version,
                    },
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => PushOutcome::Rejected(SyncMessage::ExceptionOnUpdate(e.to_string()), e),
                }
            }
            OperationType::Delete => match ctx.remote.delete_one(&filter) {
                Ok(result) if result.deleted_count == 0 => {
                    match ctx.remote.find_one(&doc! { ID_FIELD => batch.document_id.clone() }) {
                        Ok(Some(_)) => PushOutcome::Conflict(SyncMessage::VersionDifferentDeletedDoc),
                        Ok(None) => PushOutcome::Deleted,
                        Err(e) if e.is_retryable() => return Err(e),
                        Err(e) => PushOutcome::Rejected(SyncMessage::ExceptionOnDelete(e.to_string()), e),
                    }
                }
                Ok(_) => PushOutcome::Deleted,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => PushOutcome::Rejected(SyncMessage::ExceptionOnDelete(e.to_string()), e),
            },
            OperationType::Unknown => {
                let decision = Decision::new(
                    SyncAction::DropEventAndPause,
                    SyncMessage::UnknownOptype(OperationType::Unknown),
                );
                log_decision(t, L2R, &ctx.namespace, &batch.document_id, &decision);
                batch.report(SyncError::decoding(decision.message.to_string()));
                batch.pause();
                tally.documents_paused += 1;
                return Ok(());
            }
        };

        match outcome {
            PushOutcome::Pushed { hash, version } => {
                debug!(
                    t,
                    ns = %ctx.namespace,
                    document_id = %batch.document_id,
                    op = %local_event.operation_type,
                    counter = version.version_counter,
                    "local write pushed"
                );
                batch.emit(local_event.without_uncommitted_writes());
                batch.acknowledge(hash, Some(version.to_document()), true);
                tally.local_writes_pushed += 1;
            }
            PushOutcome::Deleted => {
                log_decision(
                    t,
                    L2R,
                    &ctx.namespace,
                    &batch.document_id,
                    &Decision::new(SyncAction::DeleteLocalAndDesync, SyncMessage::DocumentDeleted),
                );
                batch.emit(local_event.without_uncommitted_writes());
                batch.acknowledge(0, None, false);
                tally.local_writes_pushed += 1;
            }
            PushOutcome::Conflict(message) => {
                log_decision(
                    t,
                    L2R,
                    &ctx.namespace,
                    &batch.document_id,
                    &Decision::new(SyncAction::Conflict, message),
                );
                tally.conflicts_encountered += 1;
                let remote_event = match ctx.remote.find_one(&doc! { ID_FIELD => batch.document_id.clone() }) {
                    Ok(Some(remote)) => {
                        ChangeEvent::for_local_replace(&ctx.namespace, &batch.document_id, &remote, false)
                    }
                    Ok(None) => ChangeEvent::for_local_delete(&ctx.namespace, &batch.document_id, false),
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        batch.report(e);
                        return Ok(());
                    }
                };
                if !super::resolve::resolve_conflict(t, ctx, batch, &remote_event) {
                    tally.documents_paused += 1;
                }
            }
            PushOutcome::Rejected(message, error) => {
                log_decision(
                    t,
                    L2R,
                    &ctx.namespace,
                    &batch.document_id,
                    &Decision::new(SyncAction::DropEventAndPause, message),
                );
                batch.report(error);
                batch.pause();
                tally.documents_paused += 1;
            }
        }
        Ok(())
    }
}

fn missing_local_document(t: i64, ctx: &NamespaceContext, batch: &mut DocumentBatch, tally: &mut PassTally) {
    let decision = Decision::new(SyncAction::DropEventAndPause, SyncMessage::ExpectedLocalDocumentToExist);
    log_decision(t, L2R, &ctx.namespace, &batch.document_id, &decision);
    batch.report(SyncError::DocumentDoesNotExist {
        message: decision.message.to_string(),
    });
    batch.pause();
    tally.documents_paused += 1;
}
