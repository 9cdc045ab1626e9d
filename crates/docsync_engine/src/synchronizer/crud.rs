//! Local reads and writes on synchronized collections.
//!
//! Reads go straight to the local store. Writes are applied locally at once,
//! journaled in the undo collection while in flight, and recorded as pending
//! writes that the next pass pushes to the remote.

use docsync_codec::{doc, Document, ObjectId, Value};
use docsync_protocol::{sanitize_document, ChangeEvent, MongoNamespace, OperationType, UpdateDescription, ID_FIELD};
use docsync_storage::{apply_update, upsert_seed};
use tracing::{debug, warn};

use super::batch::Outbox;
use super::{
    ensure_namespace, forget_document, record_local_write, restore_tracked, DataSynchronizer, EngineState,
};
use crate::error::SyncResult;
use crate::instance_config::local_user_database;
use crate::pipeline::run_pipeline;
use crate::undo::UndoJournal;

/// Result of [`DataSynchronizer::insert_one`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncInsertOneResult {
    /// `_id` of the inserted document.
    pub inserted_id: Value,
}

/// Result of [`DataSynchronizer::insert_many`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncInsertManyResult {
    /// `_id`s of the inserted documents, in input order.
    pub inserted_ids: Vec<Value>,
}

/// Result of [`DataSynchronizer::update_one`] and
/// [`DataSynchronizer::update_many`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncUpdateResult {
    /// Documents matched by the filter.
    pub matched_count: u64,
    /// Matched documents whose content changed.
    pub modified_count: u64,
    /// `_id` of the document created by an upsert.
    pub upserted_id: Option<Value>,
}

/// Result of [`DataSynchronizer::delete_one`] and
/// [`DataSynchronizer::delete_many`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDeleteResult {
    /// Documents deleted locally.
    pub deleted_count: u64,
}

/// Releases the undo entries of writes that never happened.
fn release_undo(journal: &UndoJournal, ids: &[Value]) {
    for id in ids {
        if let Err(e) = journal.commit_undo(id) {
            warn!(ns = %journal.namespace(), document_id = %id, error = %e, "failed to release undo entry");
        }
    }
}

fn ensure_id(document: &mut Document) -> Value {
    if let Some(id) = document.get(ID_FIELD) {
        return id.clone();
    }
    let id = Value::ObjectId(ObjectId::new());
    document.insert(ID_FIELD, id.clone());
    id
}

impl DataSynchronizer {
    /// Number of local documents matching `filter`.
    pub fn count(&self, namespace: &MongoNamespace, filter: &Document) -> SyncResult<u64> {
        let store = self.inner.state.lock().store.clone();
        Ok(store.count(&local_user_database(namespace), &namespace.collection, filter)?)
    }

    /// Local documents matching `filter`.
    pub fn find(&self, namespace: &MongoNamespace, filter: &Document) -> SyncResult<Vec<Document>> {
        let store = self.inner.state.lock().store.clone();
        Ok(store.find(&local_user_database(namespace), &namespace.collection, filter)?)
    }

    /// First local document matching `filter`.
    pub fn find_one(&self, namespace: &MongoNamespace, filter: &Document) -> SyncResult<Option<Document>> {
        let store = self.inner.state.lock().store.clone();
        Ok(store.find_one(&local_user_database(namespace), &namespace.collection, filter)?)
    }

    /// Runs an aggregation pipeline over the local documents.
    pub fn aggregate(&self, namespace: &MongoNamespace, pipeline: &[Document]) -> SyncResult<Vec<Document>> {
        let documents = self.find(namespace, &Document::new())?;
        run_pipeline(documents, pipeline)
    }

    /// Inserts a document locally and synchronizes it.
    ///
    /// A missing `_id` is generated.
    pub fn insert_one(&self, namespace: &MongoNamespace, document: Document) -> SyncResult<SyncInsertOneResult> {
        let mut document = sanitize_document(&document);
        let inserted_id = ensure_id(&mut document);
        let outbox = {
            let mut state = self.inner.state.lock();
            let EngineState {
                store,
                config_store,
                instance,
            } = &mut *state;
            let ns_config = ensure_namespace(instance, config_store, namespace)?;
            let journal = UndoJournal::new(store.clone(), namespace.clone());
            journal.begin_undo(&inserted_id, None)?;
            if let Err(e) = store.insert_one(&local_user_database(namespace), &namespace.collection, document.clone()) {
                journal.commit_undo(&inserted_id)?;
                return Err(e.into());
            }

            let event = ChangeEvent::for_local_insert(namespace, &inserted_id, &document, true);
            if let Err(e) =
                record_local_write(ns_config, config_store, &inserted_id, self.logical_time(), event.clone(), true)
            {
                journal.roll_back(&inserted_id, None);
                return Err(e);
            }
            journal.commit_undo(&inserted_id)?;
            Outbox::with_events(ns_config.change_event_listener(), vec![event])
        };
        outbox.flush(None, None);
        debug!(ns = %namespace, document_id = %inserted_id, "inserted locally");
        Ok(SyncInsertOneResult { inserted_id })
    }

    /// Inserts documents locally, all or none, and synchronizes them.
    pub fn insert_many(&self, namespace: &MongoNamespace, documents: Vec<Document>) -> SyncResult<SyncInsertManyResult> {
        let mut prepared = Vec::with_capacity(documents.len());
        let mut inserted_ids = Vec::with_capacity(documents.len());
        for document in &documents {
            let mut document = sanitize_document(document);
            inserted_ids.push(ensure_id(&mut document));
            prepared.push(document);
        }
        if prepared.is_empty() {
            return Ok(SyncInsertManyResult { inserted_ids });
        }

        let outbox = {
            let mut state = self.inner.state.lock();
            let EngineState {
                store,
                config_store,
                instance,
            } = &mut *state;
            let ns_config = ensure_namespace(instance, config_store, namespace)?;
            let journal = UndoJournal::new(store.clone(), namespace.clone());
            for (begun, id) in inserted_ids.iter().enumerate() {
                if let Err(e) = journal.begin_undo(id, None) {
                    release_undo(&journal, &inserted_ids[..begun]);
                    return Err(e);
                }
            }
            if let Err(e) = store.insert_many(&local_user_database(namespace), &namespace.collection, prepared.clone()) {
                release_undo(&journal, &inserted_ids);
                return Err(e.into());
            }

            let t = self.logical_time();
            let mut recorded = Vec::with_capacity(prepared.len());
            let mut events = Vec::with_capacity(prepared.len());
            for (id, document) in inserted_ids.iter().zip(&prepared) {
                let event = ChangeEvent::for_local_insert(namespace, id, document, true);
                match record_local_write(ns_config, config_store, id, t, event.clone(), true) {
                    Ok(previous) => recorded.push((id, previous)),
                    Err(e) => {
                        for (id, previous) in recorded.into_iter().rev() {
                            restore_tracked(ns_config, config_store, id, previous);
                        }
                        for id in &inserted_ids {
                            journal.roll_back(id, None);
                        }
                        return Err(e);
                    }
                }
                events.push(event);
            }
            for id in &inserted_ids {
                journal.commit_undo(id)?;
            }
            Outbox::with_events(ns_config.change_event_listener(), events)
        };
        outbox.flush(None, None);
        debug!(ns = %namespace, count = inserted_ids.len(), "inserted locally");
        Ok(SyncInsertManyResult { inserted_ids })
    }

    /// Updates the first local document matching `filter`.
    ///
    /// `update` is either an operator document (`$set`, `$unset`, `$inc`,
    /// `$push`) or a replacement. With `upsert`, a document is created from
    /// the filter's equality conditions when nothing matches.
    pub fn update_one(
        &self,
        namespace: &MongoNamespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> SyncResult<SyncUpdateResult> {
        self.update_documents(namespace, filter, update, upsert, false)
    }

    /// Updates every local document matching `filter`.
    pub fn update_many(
        &self,
        namespace: &MongoNamespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> SyncResult<SyncUpdateResult> {
        self.update_documents(namespace, filter, update, upsert, true)
    }

    fn update_documents(
        &self,
        namespace: &MongoNamespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
        many: bool,
    ) -> SyncResult<SyncUpdateResult> {
        let mut result = SyncUpdateResult::default();
        let (outbox, failure) = {
            let mut state = self.inner.state.lock();
            let EngineState {
                store,
                config_store,
                instance,
            } = &mut *state;
            let user_database = local_user_database(namespace);
            let collection = namespace.collection.as_str();

            let mut matched = store.find(&user_database, collection, filter)?;
            if !many {
                matched.truncate(1);
            }
            // Plan every post-image first so a bad update changes nothing.
            let mut planned = Vec::with_capacity(matched.len());
            for before in matched {
                let Some(id) = before.get(ID_FIELD).cloned() else {
                    continue;
                };
                let after = sanitize_document(&apply_update(&before, update)?);
                planned.push((id, before, after));
            }
            let upserted = if planned.is_empty() && upsert {
                let mut document = sanitize_document(&apply_update(&upsert_seed(filter)?, update)?);
                let id = ensure_id(&mut document);
                Some((id, document))
            } else {
                None
            };

            let ns_config = ensure_namespace(instance, config_store, namespace)?;
            let journal = UndoJournal::new(store.clone(), namespace.clone());
            let t = self.logical_time();
            let mut events = Vec::new();
            let mut failure = None;
            for (id, before, after) in planned {
                result.matched_count += 1;
                if after == before {
                    continue;
                }
                let event = ChangeEvent::for_local_update(
                    namespace,
                    &id,
                    UpdateDescription::diff(&before, &after),
                    &after,
                    true,
                );
                let written = journal.begin_undo(&id, Some(&before)).and_then(|()| {
                    let replaced =
                        store.replace_one(&user_database, collection, &doc! { ID_FIELD => id.clone() }, &after, false);
                    if let Err(e) = replaced {
                        journal.commit_undo(&id)?;
                        return Err(e.into());
                    }
                    if let Err(e) = record_local_write(ns_config, config_store, &id, t, event.clone(), false) {
                        journal.roll_back(&id, Some(&before));
                        return Err(e);
                    }
                    journal.commit_undo(&id)
                });
                if let Err(e) = written {
                    failure = Some(e);
                    break;
                }
                result.modified_count += 1;
                events.push(event);
            }
            if let Some((id, document)) = upserted.filter(|_| failure.is_none()) {
                let event = ChangeEvent::for_local_insert(namespace, &id, &document, true);
                let written = journal.begin_undo(&id, None).and_then(|()| {
                    if let Err(e) = store.insert_one(&user_database, collection, document) {
                        journal.commit_undo(&id)?;
                        return Err(e.into());
                    }
                    if let Err(e) = record_local_write(ns_config, config_store, &id, t, event.clone(), true) {
                        journal.roll_back(&id, None);
                        return Err(e);
                    }
                    journal.commit_undo(&id)
                });
                match written {
                    Ok(()) => {
                        result.upserted_id = Some(id);
                        events.push(event);
                    }
                    Err(e) => failure = Some(e),
                }
            }
            (Outbox::with_events(ns_config.change_event_listener(), events), failure)
        };
        outbox.flush(None, None);
        if let Some(e) = failure {
            return Err(e);
        }
        debug!(
            ns = %namespace,
            matched = result.matched_count,
            modified = result.modified_count,
            upserted = result.upserted_id.is_some(),
            "updated locally"
        );
        Ok(result)
    }

    /// Deletes the first local document matching `filter`.
    pub fn delete_one(&self, namespace: &MongoNamespace, filter: &Document) -> SyncResult<SyncDeleteResult> {
        self.delete_documents(namespace, filter, false)
    }

    /// Deletes every local document matching `filter`.
    pub fn delete_many(&self, namespace: &MongoNamespace, filter: &Document) -> SyncResult<SyncDeleteResult> {
        self.delete_documents(namespace, filter, true)
    }

    fn delete_documents(&self, namespace: &MongoNamespace, filter: &Document, many: bool) -> SyncResult<SyncDeleteResult> {
        let mut result = SyncDeleteResult::default();
        let (outbox, failure) = {
            let mut state = self.inner.state.lock();
            let EngineState {
                store,
                config_store,
                instance,
            } = &mut *state;
            let user_database = local_user_database(namespace);
            let collection = namespace.collection.as_str();

            let mut matched = store.find(&user_database, collection, filter)?;
            if !many {
                matched.truncate(1);
            }
            if matched.is_empty() {
                return Ok(result);
            }

            let ns_config = ensure_namespace(instance, config_store, namespace)?;
            let journal = UndoJournal::new(store.clone(), namespace.clone());
            let t = self.logical_time();
            let mut events = Vec::with_capacity(matched.len());
            let mut failure = None;
            for before in matched {
                let Some(id) = before.get(ID_FIELD).cloned() else {
                    continue;
                };
                // An insert the remote never saw is forgotten outright. One
                // being pushed right now may already exist remotely.
                let never_pushed = ns_config.get(&id).is_some_and(|c| {
                    !c.push_in_flight()
                        && c.uncommitted_change_event()
                            .is_some_and(|e| e.operation_type == OperationType::Insert)
                });
                let event = ChangeEvent::for_local_delete(namespace, &id, !never_pushed);
                let written = journal.begin_undo(&id, Some(&before)).and_then(|()| {
                    if let Err(e) = store.delete_one(&user_database, collection, &doc! { ID_FIELD => id.clone() }) {
                        journal.commit_undo(&id)?;
                        return Err(e.into());
                    }
                    let recorded = if never_pushed {
                        forget_document(ns_config, config_store, &id)
                    } else {
                        record_local_write(ns_config, config_store, &id, t, event.clone(), false).map(drop)
                    };
                    if let Err(e) = recorded {
                        journal.roll_back(&id, Some(&before));
                        return Err(e);
                    }
                    journal.commit_undo(&id)
                });
                if let Err(e) = written {
                    failure = Some(e);
                    break;
                }
                result.deleted_count += 1;
                events.push(event);
            }
            (Outbox::with_events(ns_config.change_event_listener(), events), failure)
        };
        outbox.flush(None, None);
        if let Some(e) = failure {
            return Err(e);
        }
        debug!(ns = %namespace, deleted = result.deleted_count, "deleted locally");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use docsync_protocol::RemoteWins;
    use docsync_storage::MemoryStore;

    use crate::config::SyncConfig;
    use crate::doc_config::DocumentState;
    use crate::mock::MockRemoteService;

    fn ns() -> MongoNamespace {
        MongoNamespace::new("db", "todo")
    }

    fn engine() -> (DataSynchronizer, Arc<Mutex<Vec<ChangeEvent>>>) {
        let engine = DataSynchronizer::new(
            SyncConfig::new("app/user").with_worker_enabled(false),
            Arc::new(MemoryStore::new()),
            Arc::new(MockRemoteService::new()),
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine
            .configure(
                &ns(),
                Arc::new(RemoteWins),
                Some(Arc::new(move |_: &Value, e: &ChangeEvent| sink.lock().push(e.clone()))),
                None,
            )
            .unwrap();
        (engine, events)
    }

    #[test]
    fn insert_records_pending_insert() {
        let (engine, events) = engine();
        let result = engine.insert_one(&ns(), doc! { "title" => "a" }).unwrap();
        assert!(matches!(result.inserted_id, Value::ObjectId(_)));
        assert_eq!(engine.document_state(&ns(), &result.inserted_id), DocumentState::PendingLocalWrite);

        let config = engine.document_config(&ns(), &result.inserted_id).unwrap();
        assert!(!config.is_stale());
        assert_eq!(
            config.uncommitted_change_event().unwrap().operation_type,
            OperationType::Insert
        );
        let seen = events.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].has_uncommitted_writes);
        engine.verify_undo_collection_empty(&ns()).unwrap();
    }

    #[test]
    fn duplicate_insert_leaves_no_trace() {
        let (engine, _) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
        assert!(engine.insert_one(&ns(), doc! { "_id" => 1, "x" => 2 }).is_err());
        assert_eq!(engine.find(&ns(), &doc! {}).unwrap(), vec![doc! { "_id" => 1 }]);
        engine.verify_undo_collection_empty(&ns()).unwrap();
    }

    #[test]
    fn insert_many_is_all_or_nothing() {
        let (engine, _) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 2 }).unwrap();
        let failed = engine.insert_many(&ns(), vec![doc! { "_id" => 1 }, doc! { "_id" => 2 }]);
        assert!(failed.is_err());
        assert_eq!(engine.count(&ns(), &doc! {}).unwrap(), 1);
        assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::NotTracked);

        let ok = engine
            .insert_many(&ns(), vec![doc! { "_id" => 3 }, doc! { "_id" => 4 }])
            .unwrap();
        assert_eq!(ok.inserted_ids, vec![Value::from(3), Value::from(4)]);
        assert_eq!(engine.synced_ids(&ns()).len(), 3);
    }

    #[test]
    fn update_after_insert_stays_pending_insert() {
        let (engine, events) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 1, "n" => 1 }).unwrap();
        let result = engine
            .update_one(&ns(), &doc! { "_id" => 1 }, &doc! { "$inc" => doc! { "n" => 1 } }, false)
            .unwrap();
        assert_eq!((result.matched_count, result.modified_count), (1, 1));

        let config = engine.document_config(&ns(), &Value::from(1)).unwrap();
        let pending = config.uncommitted_change_event().unwrap();
        assert_eq!(pending.operation_type, OperationType::Insert);
        assert_eq!(pending.full_document, Some(doc! { "_id" => 1, "n" => 2 }));

        let seen = events.lock();
        assert_eq!(seen[1].operation_type, OperationType::Update);
        assert_eq!(
            seen[1].update_description.as_ref().unwrap().updated_fields,
            doc! { "n" => 2 }
        );
    }

    #[test]
    fn unchanged_documents_are_matched_not_modified() {
        let (engine, events) = engine();
        engine
            .insert_many(&ns(), vec![doc! { "_id" => 1, "done" => true }, doc! { "_id" => 2, "done" => false }])
            .unwrap();
        let result = engine
            .update_many(&ns(), &doc! {}, &doc! { "$set" => doc! { "done" => true } }, false)
            .unwrap();
        assert_eq!((result.matched_count, result.modified_count), (2, 1));
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn invalid_update_changes_nothing() {
        let (engine, _) = engine();
        engine
            .insert_many(&ns(), vec![doc! { "_id" => 1, "n" => 1 }, doc! { "_id" => 2, "n" => "x" }])
            .unwrap();
        let failed = engine.update_many(&ns(), &doc! {}, &doc! { "$inc" => doc! { "n" => 1 } }, false);
        assert!(failed.is_err());
        assert_eq!(engine.find_one(&ns(), &doc! { "_id" => 1 }).unwrap(), Some(doc! { "_id" => 1, "n" => 1 }));
    }

    #[test]
    fn upsert_seeds_from_filter() {
        let (engine, _) = engine();
        let result = engine
            .update_one(&ns(), &doc! { "_id" => 9, "kind" => "a" }, &doc! { "$set" => doc! { "n" => 1 } }, true)
            .unwrap();
        assert_eq!(result.matched_count, 0);
        assert_eq!(result.upserted_id, Some(Value::from(9)));
        assert_eq!(
            engine.find_one(&ns(), &doc! { "_id" => 9 }).unwrap(),
            Some(doc! { "_id" => 9, "kind" => "a", "n" => 1 })
        );
        assert_eq!(engine.document_state(&ns(), &Value::from(9)), DocumentState::PendingLocalWrite);
    }

    #[test]
    fn deleting_unpushed_insert_forgets_document() {
        let (engine, events) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
        let result = engine.delete_one(&ns(), &doc! { "_id" => 1 }).unwrap();
        assert_eq!(result.deleted_count, 1);
        assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::NotTracked);
        let seen = events.lock();
        assert_eq!(seen[1].operation_type, OperationType::Delete);
        assert!(!seen[1].has_uncommitted_writes);
    }

    #[test]
    fn deleting_insert_being_pushed_records_pending_delete() {
        let (engine, events) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
        let batch = engine.begin_push_batch(&ns(), &Value::from(1)).unwrap();
        assert!(!batch.config.push_in_flight());

        engine.delete_one(&ns(), &doc! { "_id" => 1 }).unwrap();
        let config = engine.document_config(&ns(), &Value::from(1)).unwrap();
        assert_eq!(
            config.uncommitted_change_event().unwrap().operation_type,
            OperationType::Delete
        );
        assert!(events.lock()[1].has_uncommitted_writes);

        // Once the push is over, a fresh insert is forgotten again.
        engine.end_push(&ns(), &Value::from(1));
        engine.insert_one(&ns(), doc! { "_id" => 2 }).unwrap();
        engine.delete_one(&ns(), &doc! { "_id" => 2 }).unwrap();
        assert_eq!(engine.document_state(&ns(), &Value::from(2)), DocumentState::NotTracked);
        engine.verify_undo_collection_empty(&ns()).unwrap();
    }

    #[test]
    fn deleting_pushed_document_records_pending_delete() {
        let (engine, _) = engine();
        engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
        assert!(engine.do_sync_pass().unwrap());
        assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::Synced);

        engine.delete_many(&ns(), &doc! {}).unwrap();
        let config = engine.document_config(&ns(), &Value::from(1)).unwrap();
        assert_eq!(
            config.uncommitted_change_event().unwrap().operation_type,
            OperationType::Delete
        );
        assert_eq!(engine.count(&ns(), &doc! {}).unwrap(), 0);
    }

    #[test]
    fn aggregate_runs_over_local_documents() {
        let (engine, _) = engine();
        engine
            .insert_many(
                &ns(),
                vec![doc! { "_id" => 1, "n" => 3 }, doc! { "_id" => 2, "n" => 1 }, doc! { "_id" => 3, "n" => 2 }],
            )
            .unwrap();
        let out = engine
            .aggregate(
                &ns(),
                &[doc! { "$match" => doc! { "n" => doc! { "$gt" => 1 } } }, doc! { "$sort" => doc! { "n" => 1 } }],
            )
            .unwrap();
        let ids: Vec<_> = out.iter().filter_map(|d| d.get(ID_FIELD).cloned()).collect();
        assert_eq!(ids, vec![Value::from(3), Value::from(1)]);
    }
}
