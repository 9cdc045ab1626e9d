//! In-process remote service for tests and offline development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docsync_codec::{Document, Value};
use docsync_protocol::{ChangeEvent, MongoNamespace, UpdateDescription, ID_FIELD};
use docsync_storage::{is_operator_update, LocalStore, MemoryStore, StorageError, UpdateOutcome};
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult, MONGODB_ERROR_CODE};
use crate::pipeline::run_pipeline;
use crate::remote::{RemoteCollection, RemoteService, WatchResponse};

/// A failure the mock returns instead of executing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Fail with [`SyncError::Network`].
    Network(String),
    /// Fail with [`SyncError::Service`].
    Service {
        /// Service error code.
        code: String,
        /// Error message.
        message: String,
    },
}

impl InjectedFailure {
    fn to_error(&self) -> SyncError {
        match self {
            InjectedFailure::Network(message) => SyncError::network(message.clone()),
            InjectedFailure::Service { code, message } => SyncError::service(code.clone(), message.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct ChangeLog {
    next_seq: i64,
    entries: Vec<(i64, ChangeEvent)>,
}

impl ChangeLog {
    fn record(&mut self, event: ChangeEvent) {
        self.next_seq += 1;
        self.entries.push((self.next_seq, event));
    }
}

/// A remote service implemented in process on top of a [`MemoryStore`].
///
/// Supports the CRUD functions used by [`RemoteCollection`] plus `watch`,
/// which replays a change log using sequence numbers as resume tokens.
/// `_id` uniqueness is enforced with `E11000` service errors.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use docsync_codec::doc;
/// use docsync_engine::MockRemoteService;
/// use docsync_protocol::MongoNamespace;
///
/// let remote = Arc::new(MockRemoteService::new());
/// let coll = remote.collection(MongoNamespace::new("db", "c"));
/// coll.insert_one(&doc! { "_id" => 1 }).unwrap();
/// assert!(coll.insert_one(&doc! { "_id" => 1 }).unwrap_err().is_duplicate_key());
/// ```
#[derive(Debug, Default)]
pub struct MockRemoteService {
    store: MemoryStore,
    log: Mutex<ChangeLog>,
    failures: Mutex<VecDeque<(Option<String>, InjectedFailure)>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockRemoteService {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection façade over this remote.
    pub fn collection(self: &Arc<Self>, namespace: MongoNamespace) -> RemoteCollection {
        let service: Arc<dyn RemoteService> = self.clone();
        RemoteCollection::new(service, namespace)
    }

    /// While offline every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next call, whatever its name.
    pub fn fail_next(&self, failure: InjectedFailure) {
        self.failures.lock().push_back((None, failure));
    }

    /// Fails the next call to `function`.
    pub fn fail_next_call_to(&self, function: impl Into<String>, failure: InjectedFailure) {
        self.failures.lock().push_back((Some(function.into()), failure));
    }

    /// Number of calls made to `function`, failed ones included.
    pub fn call_count(&self, function: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == function).count()
    }

    /// Current contents of a remote collection, in insertion order.
    pub fn documents(&self, namespace: &MongoNamespace) -> Vec<Document> {
        self.store
            .find(&namespace.database, &namespace.collection, &Document::new())
            .unwrap_or_default()
    }

    fn take_failure(&self, function: &str) -> Option<SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Some(SyncError::network("remote is offline"));
        }
        let mut failures = self.failures.lock();
        let position = failures
            .iter()
            .position(|(name, _)| name.as_deref().map_or(true, |n| n == function))?;
        failures.remove(position).map(|(_, failure)| failure.to_error())
    }

    fn dispatch(&self, function: &str, args: &Document) -> SyncResult<Value> {
        let database = required_str(args, "database")?;
        let collection = required_str(args, "collection")?;
        let namespace = MongoNamespace::new(database, collection);
        let query = optional_document(args, "query")?;

        match function {
            "find" => {
                let mut found = self.store.find(database, collection, &query).map_err(service_error)?;
                if let Some(limit) = args.get_i64("limit").filter(|l| *l > 0) {
                    found.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                }
                Ok(Value::Array(found.into_iter().map(Value::Document).collect()))
            }
            "findOne" => Ok(self
                .store
                .find_one(database, collection, &query)
                .map_err(service_error)?
                .map_or(Value::Null, Value::Document)),
            "count" => {
                let n = self.store.count(database, collection, &query).map_err(service_error)?;
                Ok(Value::Int64(i64::try_from(n).unwrap_or(i64::MAX)))
            }
            "aggregate" => {
                let pipeline = args
                    .get_array("pipeline")
                    .unwrap_or_default()
                    .iter()
                    .map(|stage| {
                        stage
                            .as_document()
                            .cloned()
                            .ok_or_else(|| invalid_parameter("pipeline stages must be documents"))
                    })
                    .collect::<SyncResult<Vec<_>>>()?;
                let all = self
                    .store
                    .find(database, collection, &Document::new())
                    .map_err(service_error)?;
                let out = run_pipeline(all, &pipeline)?;
                Ok(Value::Array(out.into_iter().map(Value::Document).collect()))
            }
            "insertOne" => {
                let document = args
                    .get_document("document")
                    .ok_or_else(|| invalid_parameter("insertOne requires a document"))?;
                let mut log = self.log.lock();
                let id = self
                    .store
                    .insert_one(database, collection, document.clone())
                    .map_err(service_error)?;
                self.record_insert(&mut log, &namespace, &id)?;
                let mut result = Document::new();
                result.insert("insertedId", id);
                Ok(Value::Document(result))
            }
            "insertMany" => {
                let documents = args
                    .get_array("documents")
                    .ok_or_else(|| invalid_parameter("insertMany requires documents"))?
                    .iter()
                    .map(|d| {
                        d.as_document()
                            .cloned()
                            .ok_or_else(|| invalid_parameter("insertMany requires documents"))
                    })
                    .collect::<SyncResult<Vec<_>>>()?;
                let mut log = self.log.lock();
                let ids = self
                    .store
                    .insert_many(database, collection, documents)
                    .map_err(service_error)?;
                for id in &ids {
                    self.record_insert(&mut log, &namespace, id)?;
                }
                let mut result = Document::new();
                result.insert("insertedIds", Value::Array(ids));
                Ok(Value::Document(result))
            }
            "updateOne" | "updateMany" => {
                let update = args
                    .get_document("update")
                    .ok_or_else(|| invalid_parameter("update requires an update document"))?;
                let upsert = args.get_bool("upsert").unwrap_or(false);
                let mut log = self.log.lock();
                let outcome = if function == "updateOne" {
                    self.store.update_one(database, collection, &query, update, upsert)
                } else {
                    self.store.update_many(database, collection, &query, update, upsert)
                }
                .map_err(service_error)?;
                record_updates(&mut log, &namespace, update, &outcome);
                let mut result = Document::new();
                result.insert("matchedCount", i64::try_from(outcome.matched_count).unwrap_or(i64::MAX));
                result.insert("modifiedCount", i64::try_from(outcome.modified_count).unwrap_or(i64::MAX));
                if let Some(id) = outcome.upserted_id {
                    result.insert("upsertedId", id);
                }
                Ok(Value::Document(result))
            }
            "deleteOne" | "deleteMany" => {
                let mut log = self.log.lock();
                let removed = if function == "deleteOne" {
                    self.store
                        .delete_one(database, collection, &query)
                        .map_err(service_error)?
                        .into_iter()
                        .collect()
                } else {
                    self.store
                        .delete_many(database, collection, &query)
                        .map_err(service_error)?
                };
                for document in &removed {
                    let id = document.get(ID_FIELD).cloned().unwrap_or(Value::Null);
                    log.record(ChangeEvent::for_local_delete(&namespace, &id, false));
                }
                let mut result = Document::new();
                result.insert("deletedCount", i64::try_from(removed.len()).unwrap_or(i64::MAX));
                Ok(Value::Document(result))
            }
            "watch" => {
                let ids = args.get_array("ids").unwrap_or_default();
                let log = self.log.lock();
                let response = match args.get("resumeAfter").and_then(Value::as_i64) {
                    None => WatchResponse {
                        events: Vec::new(),
                        resume_token: Value::Int64(log.next_seq),
                    },
                    Some(after) => WatchResponse {
                        events: log
                            .entries
                            .iter()
                            .filter(|(seq, event)| {
                                *seq > after
                                    && event.namespace == namespace
                                    && (ids.is_empty()
                                        || event.document_id().map_or(false, |id| ids.contains(id)))
                            })
                            .map(|(_, event)| event.clone())
                            .collect(),
                        resume_token: Value::Int64(log.next_seq),
                    },
                };
                Ok(Value::Document(response.to_document()))
            }
            other => Err(SyncError::service("FunctionNotFound", format!("function not found: '{other}'"))),
        }
    }

    fn record_insert(&self, log: &mut ChangeLog, namespace: &MongoNamespace, id: &Value) -> SyncResult<()> {
        let stored = self
            .store
            .find_by_id(&namespace.database, &namespace.collection, id)
            .map_err(service_error)?
            .ok_or_else(|| SyncError::fatal("inserted document vanished"))?;
        log.record(ChangeEvent::for_local_insert(namespace, id, &stored, false));
        Ok(())
    }
}

fn record_updates(log: &mut ChangeLog, namespace: &MongoNamespace, update: &Document, outcome: &UpdateOutcome) {
    for change in &outcome.changes {
        let id = change.after.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        let event = match &change.before {
            None => ChangeEvent::for_local_insert(namespace, &id, &change.after, false),
            Some(before) if before == &change.after => continue,
            Some(_) if !is_operator_update(update) => {
                ChangeEvent::for_local_replace(namespace, &id, &change.after, false)
            }
            Some(before) => ChangeEvent::for_local_update(
                namespace,
                &id,
                UpdateDescription::diff(before, &change.after),
                &change.after,
                false,
            ),
        };
        log.record(event);
    }
}

impl RemoteService for MockRemoteService {
    fn call_function(&self, name: &str, args: &[Document], _timeout: Option<Duration>) -> SyncResult<Value> {
        self.calls.lock().push(name.to_string());
        if let Some(error) = self.take_failure(name) {
            return Err(error);
        }
        let first = args
            .first()
            .ok_or_else(|| invalid_parameter("expected one argument document"))?;
        self.dispatch(name, first)
    }
}

fn invalid_parameter(message: impl Into<String>) -> SyncError {
    SyncError::service("InvalidParameter", message)
}

fn required_str<'a>(args: &'a Document, key: &str) -> SyncResult<&'a str> {
    args.get_str(key)
        .ok_or_else(|| invalid_parameter(format!("missing argument '{key}'")))
}

fn optional_document(args: &Document, key: &str) -> SyncResult<Document> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(Document::new()),
        Some(Value::Document(d)) => Ok(d.clone()),
        Some(other) => Err(invalid_parameter(format!(
            "argument '{key}' must be a document, found {}",
            other.type_name()
        ))),
    }
}

fn service_error(error: StorageError) -> SyncError {
    match error {
        StorageError::DuplicateKey { collection, id } => SyncError::service(
            MONGODB_ERROR_CODE,
            format!("E11000 duplicate key error collection: {collection} index: _id_ dup key: {{ _id: {id} }}"),
        ),
        other => SyncError::service(MONGODB_ERROR_CODE, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;
    use docsync_protocol::OperationType;

    fn setup() -> (Arc<MockRemoteService>, RemoteCollection) {
        let remote = Arc::new(MockRemoteService::new());
        let coll = remote.collection(MongoNamespace::new("db", "c"));
        (remote, coll)
    }

    #[test]
    fn crud_round_trip() {
        let (_, coll) = setup();
        coll.insert_one(&doc! { "_id" => 1, "a" => 1 }).unwrap();
        coll.insert_many(&[doc! { "_id" => 2, "a" => 2 }, doc! { "_id" => 3, "a" => 3 }])
            .unwrap();
        assert_eq!(coll.count(&doc! {}).unwrap(), 3);

        let result = coll
            .update_many(&doc! { "a" => doc! { "$gte" => 2 } }, &doc! { "$inc" => doc! { "a" => 10 } }, false)
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(coll.find(&doc! { "a" => doc! { "$gt" => 10 } }, None).unwrap().len(), 2);
        assert_eq!(coll.find(&doc! {}, Some(1)).unwrap().len(), 1);

        assert_eq!(coll.delete_many(&doc! {}).unwrap().deleted_count, 3);
        assert_eq!(coll.find_one(&doc! {}).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_e11000() {
        let (_, coll) = setup();
        coll.insert_one(&doc! { "_id" => "x" }).unwrap();
        let err = coll.insert_one(&doc! { "_id" => "x" }).unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(!err.is_retryable());
    }

    #[test]
    fn watch_replays_after_token() {
        let (_, coll) = setup();
        let opened = coll.watch(&[Value::from(1)], None).unwrap();
        assert!(opened.events.is_empty());

        coll.insert_one(&doc! { "_id" => 1, "a" => 1 }).unwrap();
        coll.insert_one(&doc! { "_id" => 2, "a" => 1 }).unwrap();
        coll.update_one(&doc! { "_id" => 1 }, &doc! { "$set" => doc! { "a" => 2 } }, false)
            .unwrap();
        coll.update_one(&doc! { "_id" => 1 }, &doc! { "a" => 3 }, false).unwrap();
        coll.delete_one(&doc! { "_id" => 1 }).unwrap();

        let polled = coll.watch(&[Value::from(1)], Some(&opened.resume_token)).unwrap();
        let ops: Vec<_> = polled.events.iter().map(|e| e.operation_type).collect();
        assert_eq!(
            ops,
            vec![
                OperationType::Insert,
                OperationType::Update,
                OperationType::Replace,
                OperationType::Delete
            ]
        );
        assert_eq!(
            polled.events[1].update_description.as_ref().map(|u| u.updated_fields.clone()),
            Some(doc! { "a" => 2 })
        );

        let again = coll.watch(&[Value::from(1)], Some(&polled.resume_token)).unwrap();
        assert!(again.events.is_empty());
    }

    #[test]
    fn unmodified_update_emits_nothing() {
        let (_, coll) = setup();
        coll.insert_one(&doc! { "_id" => 1, "a" => 1 }).unwrap();
        let token = coll.watch(&[], None).unwrap().resume_token;
        coll.update_one(&doc! { "_id" => 1 }, &doc! { "$set" => doc! { "a" => 1 } }, false)
            .unwrap();
        assert!(coll.watch(&[], Some(&token)).unwrap().events.is_empty());
    }

    #[test]
    fn injected_failures() {
        let (remote, coll) = setup();
        remote.fail_next_call_to("insertOne", InjectedFailure::Network("timeout".into()));
        assert_eq!(coll.count(&doc! {}).unwrap(), 0);
        let err = coll.insert_one(&doc! { "_id" => 1 }).unwrap_err();
        assert!(err.is_retryable());
        coll.insert_one(&doc! { "_id" => 1 }).unwrap();

        remote.set_offline(true);
        assert!(coll.count(&doc! {}).unwrap_err().is_retryable());
        remote.set_offline(false);
        assert_eq!(remote.call_count("insertOne"), 2);
    }

    #[test]
    fn unknown_function() {
        let remote = MockRemoteService::new();
        let err = remote
            .call_function("drop", &[doc! { "database" => "db", "collection" => "c" }], None)
            .unwrap_err();
        assert!(matches!(err, SyncError::Service { .. }));
    }
}
