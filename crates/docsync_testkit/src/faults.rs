//! Fault injection for local stores.
//!
//! [`FaultyStore`] wraps any [`LocalStore`] and fails chosen writes, either
//! once or from some point on, as a disk error or a process dying mid-way
//! would. Reads always go through.

use std::io;
use std::sync::Arc;

use docsync_codec::{Document, Value};
use docsync_storage::{LocalStore, StorageError, StorageResult, UpdateOutcome};
use parking_lot::Mutex;

/// Kinds of store writes a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// `insert_one` and `insert_many`.
    Insert,
    /// `replace_one`, `update_one` and `update_many`.
    Update,
    /// `delete_one`, `delete_many` and `drop_collection`.
    Delete,
}

#[derive(Debug)]
struct Fault {
    kind: WriteKind,
    database_prefix: String,
    collection: Option<String>,
    // Matching writes to let through first.
    skip: usize,
}

impl Fault {
    fn matches(&self, kind: WriteKind, database: &str, collection: &str) -> bool {
        self.kind == kind
            && database.starts_with(&self.database_prefix)
            && self.collection.as_deref().map_or(true, |c| c == collection)
    }
}

#[derive(Debug, Default)]
struct Faults {
    once: Vec<Fault>,
    crash_after: Option<String>,
    crashed: bool,
}

/// A store that fails writes on demand.
pub struct FaultyStore {
    inner: Arc<dyn LocalStore>,
    faults: Mutex<Faults>,
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore").field("faults", &*self.faults.lock()).finish()
    }
}

impl FaultyStore {
    /// Wraps `inner`; nothing fails until asked to.
    pub fn new(inner: Arc<dyn LocalStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Faults::default()),
        })
    }

    /// The wrapped store.
    pub fn inner(&self) -> Arc<dyn LocalStore> {
        self.inner.clone()
    }

    /// Fails the next `kind` write to a database starting with
    /// `database_prefix`.
    pub fn fail_next(&self, kind: WriteKind, database_prefix: &str) {
        self.faults.lock().once.push(Fault {
            kind,
            database_prefix: database_prefix.to_string(),
            collection: None,
            skip: 0,
        });
    }

    /// Like [`Self::fail_next`], restricted to one collection.
    pub fn fail_next_in(&self, kind: WriteKind, database_prefix: &str, collection: &str) {
        self.fail_later_in(kind, database_prefix, collection, 0);
    }

    /// Lets `skip` matching writes through, then fails the next one.
    pub fn fail_later_in(&self, kind: WriteKind, database_prefix: &str, collection: &str, skip: usize) {
        self.faults.lock().once.push(Fault {
            kind,
            database_prefix: database_prefix.to_string(),
            collection: Some(collection.to_string()),
            skip,
        });
    }

    /// After the next successful write to a database starting with
    /// `database_prefix`, every write fails, as if the process died there.
    pub fn crash_after_write_to(&self, database_prefix: &str) {
        self.faults.lock().crash_after = Some(database_prefix.to_string());
    }

    /// True once a crash was triggered.
    pub fn has_crashed(&self) -> bool {
        self.faults.lock().crashed
    }

    /// Clears every pending fault and lets writes through again, as when the
    /// process starts over.
    pub fn revive(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn before_write(&self, kind: WriteKind, database: &str, collection: &str) -> StorageResult<()> {
        let mut faults = self.faults.lock();
        if faults.crashed {
            return Err(injected(format!("store is down, {kind:?} to {database}.{collection} refused")));
        }
        if let Some(i) = faults.once.iter().position(|f| f.matches(kind, database, collection)) {
            if faults.once[i].skip > 0 {
                faults.once[i].skip -= 1;
            } else {
                faults.once.remove(i);
                return Err(injected(format!("injected {kind:?} failure on {database}.{collection}")));
            }
        }
        Ok(())
    }

    fn after_write(&self, database: &str) {
        let mut faults = self.faults.lock();
        if faults
            .crash_after
            .as_deref()
            .is_some_and(|prefix| database.starts_with(prefix))
        {
            faults.crash_after = None;
            faults.crashed = true;
        }
    }

    fn write<T>(
        &self,
        kind: WriteKind,
        database: &str,
        collection: &str,
        op: impl FnOnce(&dyn LocalStore) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.before_write(kind, database, collection)?;
        let out = op(self.inner.as_ref())?;
        self.after_write(database);
        Ok(out)
    }
}

fn injected(message: String) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, message))
}

impl LocalStore for FaultyStore {
    fn insert_one(&self, database: &str, collection: &str, document: Document) -> StorageResult<Value> {
        self.write(WriteKind::Insert, database, collection, |s| {
            s.insert_one(database, collection, document)
        })
    }

    fn insert_many(&self, database: &str, collection: &str, documents: Vec<Document>) -> StorageResult<Vec<Value>> {
        self.write(WriteKind::Insert, database, collection, |s| {
            s.insert_many(database, collection, documents)
        })
    }

    fn find(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.inner.find(database, collection, filter)
    }

    fn find_one(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Option<Document>> {
        self.inner.find_one(database, collection, filter)
    }

    fn find_by_id(&self, database: &str, collection: &str, id: &Value) -> StorageResult<Option<Document>> {
        self.inner.find_by_id(database, collection, id)
    }

    fn count(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<u64> {
        self.inner.count(database, collection, filter)
    }

    fn replace_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(WriteKind::Update, database, collection, |s| {
            s.replace_one(database, collection, filter, replacement, upsert)
        })
    }

    fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(WriteKind::Update, database, collection, |s| {
            s.update_one(database, collection, filter, update, upsert)
        })
    }

    fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(WriteKind::Update, database, collection, |s| {
            s.update_many(database, collection, filter, update, upsert)
        })
    }

    fn delete_one(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Option<Document>> {
        self.write(WriteKind::Delete, database, collection, |s| {
            s.delete_one(database, collection, filter)
        })
    }

    fn delete_many(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.write(WriteKind::Delete, database, collection, |s| {
            s.delete_many(database, collection, filter)
        })
    }

    fn collection_names(&self, database: &str) -> StorageResult<Vec<String>> {
        self.inner.collection_names(database)
    }

    fn database_names(&self) -> StorageResult<Vec<String>> {
        self.inner.database_names()
    }

    fn drop_collection(&self, database: &str, collection: &str) -> StorageResult<()> {
        self.write(WriteKind::Delete, database, collection, |s| {
            s.drop_collection(database, collection)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scenarios::synced_engine_with;
    use crate::fixtures::TestEngine;
    use docsync_codec::doc;
    use docsync_engine::{DocumentState, SyncError};
    use docsync_protocol::MongoNamespace;
    use docsync_storage::MemoryStore;

    const CONFIG_DB: &str = "sync_config_";
    const RECORDS: &str = "documents";

    fn faulty_engine(count: i32) -> (Arc<FaultyStore>, TestEngine) {
        let store = FaultyStore::new(Arc::new(MemoryStore::new()));
        let t = synced_engine_with(count, TestEngine::with_store(store.clone()));
        (store, t)
    }

    #[test]
    fn test_one_shot_fault_fires_once() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new()));
        store.fail_next(WriteKind::Insert, "db");
        assert!(store.insert_one("db", "c", doc! { "_id" => 1 }).is_err());
        store.insert_one("db", "c", doc! { "_id" => 1 }).unwrap();
        assert_eq!(store.count("db", "c", &Document::new()).unwrap(), 1);
    }

    #[test]
    fn test_crash_refuses_later_writes_until_revived() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new()));
        store.crash_after_write_to("user");
        store.insert_one("other", "c", doc! { "_id" => 1 }).unwrap();
        assert!(!store.has_crashed());
        store.insert_one("user", "c", doc! { "_id" => 1 }).unwrap();
        assert!(store.has_crashed());
        assert!(store.delete_one("other", "c", &doc! { "_id" => 1 }).is_err());
        assert_eq!(store.find_by_id("user", "c", &Value::from(1)).unwrap(), Some(doc! { "_id" => 1 }));

        store.revive();
        store.delete_one("other", "c", &doc! { "_id" => 1 }).unwrap();
    }

    #[test]
    fn test_insert_is_undone_when_bookkeeping_fails() {
        let (store, t) = faulty_engine(0);
        store.fail_next_in(WriteKind::Update, CONFIG_DB, RECORDS);

        let err = t.insert_one(&t.namespace, doc! { "_id" => 1 }).unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)), "{err}");
        assert_eq!(t.local(1), None);
        assert_eq!(t.state(1), DocumentState::NotTracked);
        t.assert_undo_empty();

        t.insert_one(&t.namespace, doc! { "_id" => 1 }).unwrap();
        t.pass();
        assert_eq!(t.remote_document(1), Some(doc! { "_id" => 1 }));
    }

    #[test]
    fn test_insert_many_is_undone_when_any_bookkeeping_fails() {
        let (store, t) = faulty_engine(0);
        // The first record saves; the second fails.
        store.fail_later_in(WriteKind::Update, CONFIG_DB, RECORDS, 1);

        let docs = vec![doc! { "_id" => 1 }, doc! { "_id" => 2 }];
        assert!(t.insert_many(&t.namespace, docs.clone()).is_err());
        assert_eq!(t.local(1), None);
        assert_eq!(t.local(2), None);
        assert_eq!(t.state(1), DocumentState::NotTracked);
        assert_eq!(t.state(2), DocumentState::NotTracked);
        t.assert_undo_empty();

        t.insert_many(&t.namespace, docs).unwrap();
        t.pass();
        assert_eq!(t.remote_document(2), Some(doc! { "_id" => 2 }));
    }

    #[test]
    fn test_update_keeps_prior_image_when_bookkeeping_fails() {
        let (store, t) = faulty_engine(1);
        store.fail_next_in(WriteKind::Update, CONFIG_DB, RECORDS);

        let update = doc! { "$set" => doc! { "n" => 9 } };
        assert!(t.update_one(&t.namespace, &doc! { "_id" => 0 }, &update, false).is_err());
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        assert_eq!(t.state(0), DocumentState::Synced);
        t.assert_undo_empty();
    }

    #[test]
    fn test_delete_restores_document_when_bookkeeping_fails() {
        let (store, t) = faulty_engine(1);
        store.fail_next_in(WriteKind::Update, CONFIG_DB, RECORDS);

        assert!(t.delete_one(&t.namespace, &doc! { "_id" => 0 }).is_err());
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        assert_eq!(t.state(0), DocumentState::Synced);
        t.assert_undo_empty();
    }

    #[test]
    fn test_desync_restores_document_when_record_removal_fails() {
        let (store, t) = faulty_engine(1);
        store.fail_next_in(WriteKind::Delete, CONFIG_DB, RECORDS);

        assert!(t.desync(&t.namespace, &[Value::from(0)]).is_err());
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        assert_eq!(t.state(0), DocumentState::Synced);
        t.assert_undo_empty();
    }

    #[test]
    fn test_remote_apply_is_rolled_back_when_bookkeeping_fails() {
        let (store, t) = faulty_engine(1);
        t.remote_replace(0, doc! { "_id" => 0, "n" => 5 });
        store.fail_next_in(WriteKind::Update, CONFIG_DB, RECORDS);

        assert!(t.do_sync_pass().is_err());
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        assert_eq!(t.state(0), DocumentState::Synced);
        t.assert_undo_empty();

        t.pass();
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 5 }));
        t.assert_undo_empty();
    }

    #[test]
    fn test_crash_on_first_write_to_new_namespace_is_recovered() {
        let (store, t) = faulty_engine(0);
        let notes = MongoNamespace::new("testkit", "notes");
        store.crash_after_write_to("sync_user_");

        assert!(t.insert_one(&notes, doc! { "_id" => 1 }).is_err());
        assert!(store.has_crashed());
        assert_eq!(
            t.find_one(&notes, &doc! { "_id" => 1 }).unwrap(),
            Some(doc! { "_id" => 1 }),
            "the half-applied insert is still on disk"
        );

        store.revive();
        let t = t.reopen();
        assert_eq!(t.find_one(&notes, &doc! { "_id" => 1 }).unwrap(), None);
        t.verify_undo_collection_empty(&notes).unwrap();
        assert_eq!(t.document_state(&notes, &Value::from(1)), DocumentState::NotTracked);
    }
}
