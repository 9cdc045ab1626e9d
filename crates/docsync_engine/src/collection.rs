//! Typed collection handles over a [`DataSynchronizer`].

use std::marker::PhantomData;
use std::sync::Arc;

use docsync_codec::{Document, Value};
use docsync_protocol::{ChangeEvent, ConflictHandler, DocumentCodec, MongoNamespace, ProtocolResult};
use tracing::warn;

use crate::delegate::{ChangeEventListener, ErrorListener};
use crate::doc_config::DocumentState;
use crate::error::{SyncError, SyncResult};
use crate::synchronizer::{
    DataSynchronizer, SyncDeleteResult, SyncInsertManyResult, SyncInsertOneResult, SyncUpdateResult,
};

/// Adapts a conflict handler over `T` to the engine's document handler.
///
/// Both events are decoded into `T` before the handler runs and the
/// resolution is encoded back.
pub struct TypedConflictHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedConflictHandler<T, H> {
    /// Wraps `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<T, H> ConflictHandler<Document> for TypedConflictHandler<T, H>
where
    T: DocumentCodec,
    H: ConflictHandler<T>,
{
    fn resolve_conflict(
        &self,
        document_id: &Value,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> ProtocolResult<Option<Document>> {
        let local = local_event.transform::<T>()?;
        let remote = remote_event.transform::<T>()?;
        let resolution = self.handler.resolve_conflict(document_id, &local, &remote)?;
        Ok(resolution.map(|value| value.to_document()).transpose()?)
    }
}

struct TypedListener<T, F> {
    listener: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> ChangeEventListener for TypedListener<T, F>
where
    T: DocumentCodec,
    F: Fn(&Value, &ChangeEvent<T>) + Send + Sync,
{
    fn on_event(&self, document_id: &Value, event: &ChangeEvent) {
        match event.transform::<T>() {
            Ok(typed) => (self.listener)(document_id, &typed),
            Err(e) => warn!(
                ns = %event.namespace,
                document_id = %document_id,
                error = %e,
                "change event does not decode; not delivered"
            ),
        }
    }
}

/// A synchronized collection whose documents decode into `T`.
///
/// Every operation is local; the engine pushes writes on its next pass.
pub struct SyncCollection<T = Document> {
    engine: DataSynchronizer,
    namespace: MongoNamespace,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SyncCollection<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SyncCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCollection")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl DataSynchronizer {
    /// Typed handle on `namespace`.
    pub fn collection<T: DocumentCodec + 'static>(&self, namespace: MongoNamespace) -> SyncCollection<T> {
        SyncCollection::new(self.clone(), namespace)
    }
}

fn decode_all<T: DocumentCodec>(documents: Vec<Document>) -> SyncResult<Vec<T>> {
    documents
        .iter()
        .map(|d| T::from_document(d).map_err(SyncError::from))
        .collect()
}

impl<T: DocumentCodec + 'static> SyncCollection<T> {
    /// Handle on `namespace` of `engine`.
    pub fn new(engine: DataSynchronizer, namespace: MongoNamespace) -> Self {
        Self {
            engine,
            namespace,
            _marker: PhantomData,
        }
    }

    /// The namespace of this collection.
    pub fn namespace(&self) -> &MongoNamespace {
        &self.namespace
    }

    /// The engine behind this collection.
    pub fn engine(&self) -> &DataSynchronizer {
        &self.engine
    }

    /// Registers the conflict handler and starts synchronizing.
    pub fn configure<H>(&self, conflict_handler: H) -> SyncResult<()>
    where
        H: ConflictHandler<T> + 'static,
    {
        self.engine.configure(
            &self.namespace,
            Arc::new(TypedConflictHandler::new(conflict_handler)),
            None,
            None,
        )
    }

    /// Like [`Self::configure`], also registering listeners.
    pub fn configure_with_listener<H, L>(
        &self,
        conflict_handler: H,
        change_event_listener: L,
        error_listener: Option<Arc<dyn ErrorListener>>,
    ) -> SyncResult<()>
    where
        H: ConflictHandler<T> + 'static,
        L: Fn(&Value, &ChangeEvent<T>) + Send + Sync + 'static,
    {
        let listener = TypedListener {
            listener: change_event_listener,
            _marker: PhantomData,
        };
        self.engine.configure(
            &self.namespace,
            Arc::new(TypedConflictHandler::new(conflict_handler)),
            Some(Arc::new(listener)),
            error_listener,
        )
    }

    /// Starts synchronizing `ids`.
    pub fn sync(&self, ids: &[Value]) -> SyncResult<()> {
        self.engine.sync(&self.namespace, ids)
    }

    /// Stops synchronizing `ids` and deletes their local copies.
    pub fn desync(&self, ids: &[Value]) -> SyncResult<()> {
        self.engine.desync(&self.namespace, ids)
    }

    /// Synchronized `_id`s.
    pub fn synced_ids(&self) -> Vec<Value> {
        self.engine.synced_ids(&self.namespace)
    }

    /// Paused `_id`s.
    pub fn paused_ids(&self) -> Vec<Value> {
        self.engine.paused_ids(&self.namespace)
    }

    /// Lifecycle state of one document.
    pub fn document_state(&self, document_id: &Value) -> DocumentState {
        self.engine.document_state(&self.namespace, document_id)
    }

    /// Resumes a paused document.
    pub fn resume_sync(&self, document_id: &Value) -> SyncResult<bool> {
        self.engine.resume_sync(&self.namespace, document_id)
    }

    /// Number of local documents matching `filter`.
    pub fn count(&self, filter: &Document) -> SyncResult<u64> {
        self.engine.count(&self.namespace, filter)
    }

    /// Local documents matching `filter`.
    pub fn find(&self, filter: &Document) -> SyncResult<Vec<T>> {
        decode_all(self.engine.find(&self.namespace, filter)?)
    }

    /// First local document matching `filter`.
    pub fn find_one(&self, filter: &Document) -> SyncResult<Option<T>> {
        self.engine
            .find_one(&self.namespace, filter)?
            .map(|d| T::from_document(&d).map_err(SyncError::from))
            .transpose()
    }

    /// Runs an aggregation pipeline; results are returned as documents.
    pub fn aggregate(&self, pipeline: &[Document]) -> SyncResult<Vec<Document>> {
        self.engine.aggregate(&self.namespace, pipeline)
    }

    /// Inserts `value` locally.
    pub fn insert_one(&self, value: &T) -> SyncResult<SyncInsertOneResult> {
        self.engine.insert_one(&self.namespace, value.to_document()?)
    }

    /// Inserts `values` locally, all or none.
    pub fn insert_many(&self, values: &[T]) -> SyncResult<SyncInsertManyResult> {
        let documents = values
            .iter()
            .map(|v| v.to_document().map_err(SyncError::from))
            .collect::<SyncResult<Vec<_>>>()?;
        self.engine.insert_many(&self.namespace, documents)
    }

    /// Updates the first local document matching `filter`.
    pub fn update_one(&self, filter: &Document, update: &Document, upsert: bool) -> SyncResult<SyncUpdateResult> {
        self.engine.update_one(&self.namespace, filter, update, upsert)
    }

    /// Updates every local document matching `filter`.
    pub fn update_many(&self, filter: &Document, update: &Document, upsert: bool) -> SyncResult<SyncUpdateResult> {
        self.engine.update_many(&self.namespace, filter, update, upsert)
    }

    /// Deletes the first local document matching `filter`.
    pub fn delete_one(&self, filter: &Document) -> SyncResult<SyncDeleteResult> {
        self.engine.delete_one(&self.namespace, filter)
    }

    /// Deletes every local document matching `filter`.
    pub fn delete_many(&self, filter: &Document) -> SyncResult<SyncDeleteResult> {
        self.engine.delete_many(&self.namespace, filter)
    }
}

/// Async counterpart of [`SyncCollection`].
///
/// Each call runs the blocking operation on the tokio blocking pool.
pub struct AsyncSyncCollection<T = Document> {
    inner: SyncCollection<T>,
}

impl<T> Clone for AsyncSyncCollection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AsyncSyncCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSyncCollection")
            .field("namespace", &self.inner.namespace)
            .finish()
    }
}

impl<T> From<SyncCollection<T>> for AsyncSyncCollection<T> {
    fn from(inner: SyncCollection<T>) -> Self {
        Self { inner }
    }
}

impl<T: DocumentCodec + Send + 'static> AsyncSyncCollection<T> {
    /// The blocking handle.
    pub fn blocking(&self) -> &SyncCollection<T> {
        &self.inner
    }

    async fn run_blocking<R, F>(&self, operation: F) -> SyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce(SyncCollection<T>) -> SyncResult<R> + Send + 'static,
    {
        let collection = self.inner.clone();
        tokio::task::spawn_blocking(move || operation(collection))
            .await
            .map_err(|e| SyncError::fatal(format!("blocking task failed: {e}")))?
    }

    /// See [`SyncCollection::sync`].
    pub async fn sync(&self, ids: Vec<Value>) -> SyncResult<()> {
        self.run_blocking(move |c| c.sync(&ids)).await
    }

    /// See [`SyncCollection::desync`].
    pub async fn desync(&self, ids: Vec<Value>) -> SyncResult<()> {
        self.run_blocking(move |c| c.desync(&ids)).await
    }

    /// See [`SyncCollection::count`].
    pub async fn count(&self, filter: Document) -> SyncResult<u64> {
        self.run_blocking(move |c| c.count(&filter)).await
    }

    /// See [`SyncCollection::find`].
    pub async fn find(&self, filter: Document) -> SyncResult<Vec<T>> {
        self.run_blocking(move |c| c.find(&filter)).await
    }

    /// See [`SyncCollection::find_one`].
    pub async fn find_one(&self, filter: Document) -> SyncResult<Option<T>> {
        self.run_blocking(move |c| c.find_one(&filter)).await
    }

    /// See [`SyncCollection::aggregate`].
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> SyncResult<Vec<Document>> {
        self.run_blocking(move |c| c.aggregate(&pipeline)).await
    }

    /// See [`SyncCollection::insert_one`].
    pub async fn insert_one(&self, value: T) -> SyncResult<SyncInsertOneResult> {
        self.run_blocking(move |c| c.insert_one(&value)).await
    }

    /// See [`SyncCollection::insert_many`].
    pub async fn insert_many(&self, values: Vec<T>) -> SyncResult<SyncInsertManyResult> {
        self.run_blocking(move |c| c.insert_many(&values)).await
    }

    /// See [`SyncCollection::update_one`].
    pub async fn update_one(&self, filter: Document, update: Document, upsert: bool) -> SyncResult<SyncUpdateResult> {
        self.run_blocking(move |c| c.update_one(&filter, &update, upsert)).await
    }

    /// See [`SyncCollection::update_many`].
    pub async fn update_many(&self, filter: Document, update: Document, upsert: bool) -> SyncResult<SyncUpdateResult> {
        self.run_blocking(move |c| c.update_many(&filter, &update, upsert)).await
    }

    /// See [`SyncCollection::delete_one`].
    pub async fn delete_one(&self, filter: Document) -> SyncResult<SyncDeleteResult> {
        self.run_blocking(move |c| c.delete_one(&filter)).await
    }

    /// See [`SyncCollection::delete_many`].
    pub async fn delete_many(&self, filter: Document) -> SyncResult<SyncDeleteResult> {
        self.run_blocking(move |c| c.delete_many(&filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::{doc, CodecResult};
    use docsync_protocol::{ProtocolError, RemoteWins};
    use docsync_storage::MemoryStore;
    use parking_lot::Mutex;

    use crate::config::SyncConfig;
    use crate::mock::MockRemoteService;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        id: i64,
        hits: i64,
    }

    impl DocumentCodec for Counter {
        fn to_document(&self) -> CodecResult<Document> {
            Ok(doc! { "_id" => self.id, "hits" => self.hits })
        }

        fn from_document(document: &Document) -> CodecResult<Self> {
            Ok(Counter {
                id: document.require_i64("_id")?,
                hits: document.require_i64("hits")?,
            })
        }
    }

    fn engine() -> DataSynchronizer {
        DataSynchronizer::new(
            SyncConfig::new("app/user").with_worker_enabled(false),
            Arc::new(MemoryStore::new()),
            Arc::new(MockRemoteService::new()),
        )
        .unwrap()
    }

    #[test]
    fn typed_reads_and_writes() {
        let counters = engine().collection::<Counter>(MongoNamespace::new("db", "counters"));
        counters.configure(RemoteWins).unwrap();
        counters
            .insert_many(&[Counter { id: 1, hits: 0 }, Counter { id: 2, hits: 5 }])
            .unwrap();
        counters
            .update_one(&doc! { "_id" => 1 }, &doc! { "$inc" => doc! { "hits" => 3 } }, false)
            .unwrap();
        assert_eq!(
            counters.find_one(&doc! { "_id" => 1 }).unwrap(),
            Some(Counter { id: 1, hits: 3 })
        );
        assert_eq!(counters.find(&doc! {}).unwrap().len(), 2);
        assert_eq!(counters.synced_ids().len(), 2);
    }

    #[test]
    fn undecodable_documents_are_errors() {
        let engine = engine();
        let ns = MongoNamespace::new("db", "counters");
        engine.insert_one(&ns, doc! { "_id" => 1, "hits" => "many" }).unwrap();
        let counters = engine.collection::<Counter>(ns);
        assert!(matches!(counters.find(&doc! {}), Err(SyncError::Codec(_))));
    }

    #[test]
    fn typed_handler_sees_decoded_events() {
        let sum = |_: &Value, local: &ChangeEvent<Counter>, remote: &ChangeEvent<Counter>| -> ProtocolResult<Option<Counter>> {
            match (&local.full_document, &remote.full_document) {
                (Some(l), Some(r)) => Ok(Some(Counter {
                    id: l.id,
                    hits: l.hits + r.hits,
                })),
                _ => Err(ProtocolError::resolution("missing side")),
            }
        };
        let handler = TypedConflictHandler::<Counter, _>::new(sum);
        let ns = MongoNamespace::new("db", "counters");
        let local = ChangeEvent::for_local_replace(&ns, &Value::from(1), &doc! { "_id" => 1, "hits" => 2 }, true);
        let remote = ChangeEvent::for_local_replace(&ns, &Value::from(1), &doc! { "_id" => 1, "hits" => 3 }, false);
        let resolved = handler.resolve_conflict(&Value::from(1), &local, &remote).unwrap();
        assert_eq!(resolved, Some(doc! { "_id" => 1i64, "hits" => 5i64 }));
    }

    #[test]
    fn typed_listener_receives_decoded_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let counters = engine().collection::<Counter>(MongoNamespace::new("db", "counters"));
        counters
            .configure_with_listener(
                RemoteWins,
                move |_: &Value, e: &ChangeEvent<Counter>| {
                    if let Some(c) = &e.full_document {
                        sink.lock().push(c.clone());
                    }
                },
                None,
            )
            .unwrap();
        counters.insert_one(&Counter { id: 7, hits: 1 }).unwrap();
        assert_eq!(*seen.lock(), vec![Counter { id: 7, hits: 1 }]);
    }

    #[tokio::test]
    async fn async_collection_runs_on_blocking_pool() {
        let counters: AsyncSyncCollection<Counter> =
            engine().collection::<Counter>(MongoNamespace::new("db", "counters")).into();
        counters.blocking().configure(RemoteWins).unwrap();
        counters.insert_one(Counter { id: 1, hits: 1 }).await.unwrap();
        assert_eq!(counters.count(doc! {}).await.unwrap(), 1);
        let deleted = counters.delete_many(doc! {}).await.unwrap();
        assert_eq!(deleted.deleted_count, 1);
        assert!(counters.find(doc! {}).await.unwrap().is_empty());
    }
}
