//! Remote-to-local phase of a sync pass.

use std::collections::{HashMap, HashSet};

use docsync_codec::{doc, document_hash, Document, Value};
use docsync_protocol::{
    sanitize_document, version_document_of, version_update_document, ChangeEvent, DocumentVersionInfo,
    OperationType, Version, ID_FIELD, SYNC_PROTOCOL_VERSION,
};
use tracing::debug;

use super::batch::DocumentBatch;
use super::{DataSynchronizer, EngineState, NamespaceContext};
use crate::action::{log_decision, Decision, SyncAction, SyncMessage, R2L};
use crate::doc_config::DocumentSynchronization;
use crate::error::{SyncError, SyncResult};
use crate::instance_config::local_user_database;
use crate::stats::PassTally;

/// A document to reconcile: its latest remote event, if one was observed.
struct RemoteWork {
    document_id: Value,
    event: Option<ChangeEvent>,
    stale: bool,
}

impl DataSynchronizer {
    pub(super) fn sync_remote_to_local(
        &self,
        t: i64,
        contexts: &[NamespaceContext],
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        for ctx in contexts {
            self.check_cancelled()?;
            self.sync_namespace_remote_to_local(t, ctx, tally)?;
        }
        Ok(())
    }

    fn sync_namespace_remote_to_local(
        &self,
        t: i64,
        ctx: &NamespaceContext,
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        let namespace = &ctx.namespace;
        let (ids, resume_token) = {
            let state = self.inner.state.lock();
            match state.instance.get(namespace) {
                Some(ns) => (ns.synced_ids(), ns.resume_token().cloned()),
                None => return Ok(()),
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let response = ctx.remote.watch(&ids, resume_token.as_ref())?;
        if resume_token.is_none() {
            // Changes made while no stream was open are unknown.
            let mut state = self.inner.state.lock();
            let EngineState {
                config_store,
                instance,
                ..
            } = &mut *state;
            if let Some(ns_config) = instance.get_mut(namespace) {
                ns_config.mark_all_stale();
                for config in ns_config.documents() {
                    config_store.save_document(config)?;
                }
            }
            debug!(ns = %namespace, documents = ids.len(), "change stream opened");
        }

        let mut work: Vec<RemoteWork> = Vec::new();
        let mut index: HashMap<Value, usize> = HashMap::new();
        for event in response.events {
            let Some(id) = event.document_id().cloned() else {
                continue;
            };
            match index.get(&id) {
                Some(&i) => work[i].event = Some(event),
                None => {
                    index.insert(id.clone(), work.len());
                    work.push(RemoteWork {
                        document_id: id,
                        event: Some(event),
                        stale: false,
                    });
                }
            }
        }

        let stale: HashSet<Value> = {
            let state = self.inner.state.lock();
            state
                .instance
                .get(namespace)
                .map(|ns| {
                    ns.documents()
                        .filter(|c| c.is_stale() && !c.is_paused())
                        .map(|c| c.document_id().clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let unseen: Vec<Value> = stale.iter().filter(|id| !index.contains_key(*id)).cloned().collect();
        for item in &mut work {
            item.stale = stale.contains(&item.document_id);
        }
        if !unseen.is_empty() {
            let filter = doc! { ID_FIELD => doc! { "$in" => Value::Array(unseen.clone()) } };
            let mut found: HashMap<Value, Document> = ctx
                .remote
                .find(&filter, None)?
                .into_iter()
                .filter_map(|d| d.get(ID_FIELD).cloned().map(|id| (id, d)))
                .collect();
            for id in unseen {
                let event = found
                    .remove(&id)
                    .map(|d| ChangeEvent::for_local_replace(namespace, &id, &d, false));
                work.push(RemoteWork {
                    document_id: id,
                    event,
                    stale: true,
                });
            }
        }

        for item in work {
            self.check_cancelled()?;
            let Some(mut batch) = self.begin_batch(namespace, &item.document_id) else {
                continue;
            };
            if batch.config.is_paused() {
                continue;
            }
            if item.stale {
                batch.config.set_stale(false);
                batch.save();
            }
            match item.event {
                Some(event) => {
                    let decision = decide_remote_event(t, &batch.config, &event);
                    log_decision(t, R2L, namespace, &item.document_id, &decision);
                    self.enqueue_action(t, ctx, &mut batch, &event, decision, tally)?;
                }
                None => self.reconcile_missing_remote(t, ctx, &mut batch, tally)?,
            }
            self.commit_batch(ctx, batch)?;
        }

        let mut state = self.inner.state.lock();
        let EngineState {
            config_store,
            instance,
            ..
        } = &mut *state;
        if let Some(ns_config) = instance.get_mut(namespace) {
            ns_config.set_resume_token(Some(response.resume_token));
            config_store.save_namespace(ns_config)?;
        }
        Ok(())
    }

    /// A stale document with no remote copy.
    ///
    /// A copy seen remotely before was deleted there. A local copy that never
    /// reached the remote becomes a pending insert.
    fn reconcile_missing_remote(
        &self,
        t: i64,
        ctx: &NamespaceContext,
        batch: &mut DocumentBatch,
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        if batch.config.last_known_remote_version().is_some() {
            let event = ChangeEvent::for_local_delete(
                &ctx.namespace,
                &batch.document_id,
                batch.config.has_uncommitted_writes(),
            );
            let decision = decide_remote_event(t, &batch.config, &event);
            log_decision(t, R2L, &ctx.namespace, &batch.document_id, &decision);
            return self.enqueue_action(t, ctx, batch, &event, decision, tally);
        }
        if batch.config.has_uncommitted_writes() {
            return Ok(());
        }
        let local = {
            let state = self.inner.state.lock();
            state.store.find_by_id(
                &local_user_database(&ctx.namespace),
                &ctx.namespace.collection,
                &batch.document_id,
            )?
        };
        if let Some(local) = local {
            debug!(ns = %ctx.namespace, document_id = %batch.document_id, "local document unknown to remote; queueing insert");
            let at_time = batch.config.last_resolution();
            let event = ChangeEvent::for_local_insert(&ctx.namespace, &batch.document_id, &local, true);
            batch.config.set_some_pending_writes(at_time, None, 0, event);
            batch.save();
        }
        Ok(())
    }

    /// Carries out `decision` for `remote_event`.
    pub(super) fn enqueue_action(
        &self,
        t: i64,
        ctx: &NamespaceContext,
        batch: &mut DocumentBatch,
        remote_event: &ChangeEvent,
        decision: Decision,
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        match decision.action {
            SyncAction::Wait | SyncAction::DropEvent => {}
            SyncAction::ApplyAndVersionFromRemote => {
                let Some(full_document) = &remote_event.full_document else {
                    return self.remote_find(t, ctx, batch, tally);
                };
                let version = Version::fresh();
                batch.replace_from_remote(full_document, Some(version.to_document()));
                batch.push_remote_update(
                    doc! { ID_FIELD => batch.document_id.clone() },
                    version_update_document(&version),
                );
                tally.remote_changes_applied += 1;
            }
            SyncAction::ApplyFromRemote => {
                let Some(full_document) = &remote_event.full_document else {
                    return self.remote_find(t, ctx, batch, tally);
                };
                match version_document_of(full_document) {
                    Ok(version) => {
                        let version = version.cloned();
                        batch.replace_from_remote(full_document, version);
                        tally.remote_changes_applied += 1;
                    }
                    Err(e) => desync_undecodable(batch, e.into()),
                }
            }
            SyncAction::Conflict => {
                tally.conflicts_encountered += 1;
                if !super::resolve::resolve_conflict(t, ctx, batch, remote_event) {
                    tally.documents_paused += 1;
                }
            }
            SyncAction::RemoteFind => return self.remote_find(t, ctx, batch, tally),
            SyncAction::DropEventAndDesync => {
                desync_undecodable(batch, SyncError::decoding(decision.message.to_string()));
            }
            SyncAction::DropEventAndPause => {
                batch.report(SyncError::decoding(decision.message.to_string()));
                batch.pause();
                tally.documents_paused += 1;
            }
            SyncAction::DeleteLocal => {
                batch.delete_from_remote();
                tally.remote_changes_applied += 1;
            }
            SyncAction::DeleteLocalAndDesync => {
                batch.delete_local();
                batch.desync();
            }
        }
        Ok(())
    }

    /// Re-decides against the latest remote document.
    fn remote_find(
        &self,
        t: i64,
        ctx: &NamespaceContext,
        batch: &mut DocumentBatch,
        tally: &mut PassTally,
    ) -> SyncResult<()> {
        let found = match ctx.remote.find_one(&doc! { ID_FIELD => batch.document_id.clone() }) {
            Ok(found) => found,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                log_decision(
                    t,
                    R2L,
                    &ctx.namespace,
                    &batch.document_id,
                    &Decision::new(SyncAction::DropEvent, SyncMessage::RemoteFindFailed),
                );
                batch.report(e);
                return Ok(());
            }
        };
        let pending = batch.config.has_uncommitted_writes();
        let (event, decision) = match found {
            Some(remote) => {
                let event = ChangeEvent::for_local_replace(&ctx.namespace, &batch.document_id, &remote, false);
                let decision = match DocumentVersionInfo::from_remote_document(&remote) {
                    Err(_) => Decision::new(SyncAction::DropEventAndDesync, SyncMessage::CannotParseRemoteVersion),
                    Ok(remote_info) => {
                        let last_seen =
                            DocumentVersionInfo::from_version_document(batch.config.last_known_remote_version())
                                .ok();
                        let same_instance = match (
                            remote_info.as_ref().and_then(DocumentVersionInfo::version),
                            last_seen.as_ref().and_then(DocumentVersionInfo::version),
                        ) {
                            (Some(remote), Some(seen)) => remote.same_instance(seen),
                            _ => false,
                        };
                        if same_instance {
                            Decision::new(SyncAction::DropEvent, SyncMessage::StaleEvent)
                        } else if pending {
                            Decision::new(SyncAction::Conflict, SyncMessage::RemoteFindReplacedDoc)
                        } else {
                            Decision::new(SyncAction::ApplyFromRemote, SyncMessage::RemoteFindReplacedDoc)
                        }
                    }
                };
                (event, decision)
            }
            None => {
                let event = ChangeEvent::for_local_delete(&ctx.namespace, &batch.document_id, false);
                let decision = if pending {
                    Decision::new(SyncAction::Conflict, SyncMessage::RemoteFindDeletedDoc)
                } else {
                    Decision::new(SyncAction::DeleteLocalAndDesync, SyncMessage::RemoteFindDeletedDoc)
                };
                (event, decision)
            }
        };
        log_decision(t, R2L, &ctx.namespace, &batch.document_id, &decision);
        self.enqueue_action(t, ctx, batch, &event, decision, tally)
    }
}

fn desync_undecodable(batch: &mut DocumentBatch, error: SyncError) {
    batch.report(error);
    batch.delete_local();
    batch.desync();
}

fn remote_content_hash(event: &ChangeEvent) -> i64 {
    event
        .full_document
        .as_ref()
        .map_or(0, |d| document_hash(&sanitize_document(d)))
}

/// Decides what to do with a remote event for a document whose bookkeeping
/// is `config`, at logical time `t`.
pub(crate) fn decide_remote_event(t: i64, config: &DocumentSynchronization, remote_event: &ChangeEvent) -> Decision {
    use SyncAction as A;
    use SyncMessage as M;

    let pending = config.uncommitted_change_event();
    if pending.is_some() && config.last_resolution() == t {
        return Decision::new(A::Wait, M::SimultaneousWrites);
    }
    let op = remote_event.operation_type;
    if op == OperationType::Unknown {
        return Decision::new(A::DropEventAndPause, M::UnknownOptype(op));
    }

    let empty = Document::new();
    let remote_info =
        match DocumentVersionInfo::from_remote_document(remote_event.full_document.as_ref().unwrap_or(&empty)) {
            Ok(info) => info,
            Err(_) => return Decision::new(A::DropEventAndDesync, M::CannotParseRemoteVersion),
        };
    let remote_version = remote_info.as_ref().and_then(DocumentVersionInfo::version);
    if let Some(v) = remote_version {
        if v.sync_protocol_version != SYNC_PROTOCOL_VERSION {
            return Decision::new(A::DropEventAndDesync, M::UnknownRemoteProtocolVersion(v.sync_protocol_version));
        }
    }

    let last_seen = DocumentVersionInfo::from_version_document(config.last_known_remote_version()).ok();
    let last_seen_version = last_seen.as_ref().and_then(DocumentVersionInfo::version);
    let mut last_seen_hash = config.last_known_hash();
    let remote_hash = remote_content_hash(remote_event);
    let is_insert = op == OperationType::Insert;

    if let Some(pending) = pending {
        if op == OperationType::Delete {
            return match pending.operation_type {
                OperationType::Replace | OperationType::Update => Decision::new(A::Conflict, M::PendingWriteDelete),
                _ => Decision::new(A::DropEvent, M::PendingWriteDelete),
            };
        }
        return match (last_seen_version, remote_version) {
            (Some(seen), Some(remote)) => {
                if last_seen_hash == 0 {
                    last_seen_hash = pending
                        .full_document
                        .as_ref()
                        .map_or(0, |d| document_hash(&sanitize_document(d)));
                }
                if !remote.same_instance(seen) {
                    Decision::new(A::RemoteFind, M::InstanceIdMismatch)
                } else if remote.version_counter > seen.version_counter {
                    Decision::new(A::Conflict, M::StaleLocalWrite)
                } else if last_seen_hash != remote_hash && !is_insert {
                    Decision::new(A::Conflict, M::StaleEvent)
                } else {
                    Decision::new(A::DropEvent, M::StaleEvent)
                }
            }
            (Some(_), None) | (None, Some(_)) => Decision::new(A::Conflict, M::PendingWriteEmptyVersion),
            (None, None) if last_seen_hash != remote_hash => Decision::new(A::Conflict, M::PendingWriteEmptyVersion),
            (None, None) => Decision::new(A::DropEvent, M::PendingWriteEmptyVersion),
        };
    }

    if op == OperationType::Delete {
        return Decision::new(A::DeleteLocal, M::DeleteFromRemote);
    }
    match (last_seen_version, remote_version) {
        (Some(seen), Some(remote)) => {
            if seen.sync_protocol_version != SYNC_PROTOCOL_VERSION {
                Decision::new(A::DeleteLocalAndDesync, M::StaleProtocolVersion(seen.sync_protocol_version))
            } else if !remote.same_instance(seen) {
                Decision::new(A::RemoteFind, M::InstanceIdMismatch)
            } else if remote.version_counter > seen.version_counter {
                Decision::new(A::ApplyFromRemote, M::ApplyFromRemote)
            } else if remote.version_counter == seen.version_counter && last_seen_hash != remote_hash && !is_insert {
                Decision::new(A::ApplyFromRemote, M::RemoteUpdateWithoutVersion)
            } else {
                Decision::new(A::DropEvent, M::ProbablyGeneratedByUs)
            }
        }
        (Some(_), None) | (None, Some(_)) if last_seen_hash != remote_hash => {
            Decision::new(A::ApplyFromRemote, M::EmptyVersion)
        }
        (Some(_), None) | (None, Some(_)) => Decision::new(A::DropEvent, M::EmptyVersion),
        (None, None) => Decision::new(A::ApplyAndVersionFromRemote, M::EmptyVersion),
    }
}
