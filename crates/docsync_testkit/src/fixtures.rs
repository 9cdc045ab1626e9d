//! Test fixtures and engine helpers.
//!
//! Provides a [`TestEngine`] wiring a [`DataSynchronizer`] to a
//! [`MockRemoteService`] with the background worker disabled, so tests
//! drive sync passes explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use docsync_codec::{Document, Value};
use docsync_engine::{local_user_database, DataSynchronizer, DocumentState, MockRemoteService, SyncConfig};
use docsync_protocol::{sanitize_document, ConflictHandler, MongoNamespace, RemoteWins, ID_FIELD};
use docsync_storage::{FileStore, LocalStore, MemoryStore};
use tempfile::TempDir;

/// Instance key used by every fixture.
pub const TEST_INSTANCE_KEY: &str = "testkit-app/testkit-user";

/// The namespace configured by default.
pub fn test_namespace() -> MongoNamespace {
    MongoNamespace::new("testkit", "todo")
}

/// An engine over a mock remote with automatic cleanup.
pub struct TestEngine {
    /// The engine.
    pub engine: DataSynchronizer,
    /// The remote every pass talks to.
    pub remote: Arc<MockRemoteService>,
    /// The local store.
    pub store: Arc<dyn LocalStore>,
    /// The configured namespace.
    pub namespace: MongoNamespace,
    handler: Arc<dyn ConflictHandler<Document>>,
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over an in-memory store, resolving conflicts with
    /// [`RemoteWins`].
    pub fn memory() -> Self {
        Self::memory_with_handler(Arc::new(RemoteWins))
    }

    /// Creates an engine over an in-memory store with `handler`.
    pub fn memory_with_handler(handler: Arc<dyn ConflictHandler<Document>>) -> Self {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        Self::open(store, Arc::new(MockRemoteService::new()), handler, None)
    }

    /// Creates an engine over `store`, resolving conflicts with
    /// [`RemoteWins`].
    pub fn with_store(store: Arc<dyn LocalStore>) -> Self {
        Self::open(store, Arc::new(MockRemoteService::new()), Arc::new(RemoteWins), None)
    }

    /// Creates an engine over a file store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store: Arc<dyn LocalStore> =
            Arc::new(FileStore::open(temp_dir.path()).expect("Failed to open file store"));
        Self::open(
            store,
            Arc::new(MockRemoteService::new()),
            Arc::new(RemoteWins),
            Some(temp_dir),
        )
    }

    fn open(
        store: Arc<dyn LocalStore>,
        remote: Arc<MockRemoteService>,
        handler: Arc<dyn ConflictHandler<Document>>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let engine = DataSynchronizer::new(
            SyncConfig::new(TEST_INSTANCE_KEY).with_worker_enabled(false),
            store.clone(),
            remote.clone(),
        )
        .expect("Failed to open engine");
        let namespace = test_namespace();
        engine
            .configure(&namespace, handler.clone(), None, None)
            .expect("Failed to configure namespace");
        Self {
            engine,
            remote,
            store,
            namespace,
            handler,
            _temp_dir: temp_dir,
        }
    }

    /// Store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Closes the engine and opens a new one over the same store, as after
    /// a process restart. The remote is kept.
    pub fn reopen(self) -> Self {
        let Self {
            engine,
            remote,
            store,
            handler,
            _temp_dir: temp_dir,
            ..
        } = self;
        engine.close();
        drop(engine);
        let store = match temp_dir.as_ref() {
            Some(dir) => {
                drop(store);
                reopen_file_store(dir.path())
            }
            None => store,
        };
        Self::open(store, remote, handler, temp_dir)
    }

    /// Runs one sync pass, panicking on failure.
    pub fn pass(&self) {
        assert!(
            self.engine.do_sync_pass().expect("Sync pass failed"),
            "Sync pass did not run"
        );
    }

    /// Runs `n` sync passes.
    pub fn passes(&self, n: usize) {
        for _ in 0..n {
            self.pass();
        }
    }

    /// The local copy of `id`.
    pub fn local(&self, id: impl Into<Value>) -> Option<Document> {
        self.store
            .find_by_id(
                &local_user_database(&self.namespace),
                &self.namespace.collection,
                &id.into(),
            )
            .expect("Failed to read local document")
    }

    /// The remote copy of `id`, without sync metadata.
    pub fn remote_document(&self, id: impl Into<Value>) -> Option<Document> {
        let id = id.into();
        self.remote
            .documents(&self.namespace)
            .into_iter()
            .find(|d| d.get(ID_FIELD) == Some(&id))
            .map(|d| sanitize_document(&d))
    }

    /// Lifecycle state of `id`.
    pub fn state(&self, id: impl Into<Value>) -> DocumentState {
        self.engine.document_state(&self.namespace, &id.into())
    }

    /// Replaces `id` on the remote as another, unversioned client would.
    pub fn remote_replace(&self, id: impl Into<Value>, replacement: Document) {
        let id = id.into();
        let mut filter = Document::new();
        filter.insert(ID_FIELD, id);
        let result = self
            .remote
            .collection(self.namespace.clone())
            .update_one(&filter, &replacement, false)
            .expect("Failed to replace remote document");
        assert_eq!(result.matched_count, 1, "Remote document not found");
    }

    /// Deletes `id` on the remote as another client would.
    pub fn remote_delete(&self, id: impl Into<Value>) {
        let mut filter = Document::new();
        filter.insert(ID_FIELD, id.into());
        self.remote
            .collection(self.namespace.clone())
            .delete_one(&filter)
            .expect("Failed to delete remote document");
    }

    /// Asserts the undo journal of the namespace is empty.
    pub fn assert_undo_empty(&self) {
        self.engine
            .verify_undo_collection_empty(&self.namespace)
            .expect("Undo journal is not empty");
    }
}

impl std::ops::Deref for TestEngine {
    type Target = DataSynchronizer;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

fn reopen_file_store(dir: &Path) -> Arc<dyn LocalStore> {
    Arc::new(FileStore::open(dir).expect("Failed to reopen file store"))
}

/// Runs a test with an in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use docsync_testkit::with_test_engine;
///
/// #[test]
/// fn my_test() {
///     with_test_engine(|t| {
///         t.insert_one(&t.namespace, doc! { "_id" => 1 }).unwrap();
///         t.pass();
///     });
/// }
/// ```
pub fn with_test_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory();
    f(&engine)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use docsync_codec::doc;

    /// An engine with `count` documents `{_id: i, n: i}` already pushed.
    pub fn synced_engine(count: i32) -> TestEngine {
        synced_engine_with(count, TestEngine::memory())
    }

    /// Inserts `count` documents into `engine` and pushes them.
    pub fn synced_engine_with(count: i32, engine: TestEngine) -> TestEngine {
        for i in 0..count {
            engine
                .insert_one(&engine.namespace, doc! { "_id" => i, "n" => i })
                .expect("Failed to insert document");
        }
        engine.pass();
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;

    #[test]
    fn test_memory_engine() {
        let t = TestEngine::memory();
        assert!(t.is_configured(&t.namespace));
        assert!(t.path().is_none());
    }

    #[test]
    fn test_with_test_engine() {
        with_test_engine(|t| {
            t.insert_one(&t.namespace, doc! { "_id" => 1 }).unwrap();
            assert_eq!(t.state(1), DocumentState::PendingLocalWrite);
        });
    }

    #[test]
    fn test_synced_scenario() {
        let t = scenarios::synced_engine(3);
        assert_eq!(t.remote.documents(&t.namespace).len(), 3);
        assert_eq!(t.state(2), DocumentState::Synced);
        assert_eq!(t.remote_document(2), Some(doc! { "_id" => 2, "n" => 2 }));
    }

    #[test]
    fn test_file_engine_reopens() {
        let t = scenarios::synced_engine_with(2, TestEngine::file());
        let t = t.reopen();
        assert_eq!(t.synced_ids(&t.namespace).len(), 2);
        assert_eq!(t.local(1), Some(doc! { "_id" => 1, "n" => 1 }));
    }
}
