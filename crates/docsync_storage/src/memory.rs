//! In-memory store for tests and ephemeral engines.

use docsync_codec::{Document, Value};
use parking_lot::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::state::{Mutation, StoreState};
use crate::store::{LocalStore, UpdateOutcome};

/// A store that keeps everything in memory.
///
/// All data is lost when the store is dropped.
///
/// # Example
///
/// ```rust
/// use docsync_codec::doc;
/// use docsync_storage::{LocalStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// store.insert_one("db", "people", doc! { "_id" => 1, "name" => "ada" }).unwrap();
/// assert_eq!(store.count("db", "people", &doc! {}).unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write<R>(
        &self,
        plan: impl FnOnce(&StoreState) -> StorageResult<(Vec<Mutation>, R)>,
    ) -> StorageResult<R> {
        let mut state = self.state.write();
        let (mutations, result) = plan(&*state)?;
        state.apply(mutations);
        Ok(result)
    }
}

impl LocalStore for MemoryStore {
    fn insert_one(&self, database: &str, collection: &str, document: Document) -> StorageResult<Value> {
        let mut ids = self.insert_many(database, collection, vec![document])?;
        ids.pop()
            .ok_or_else(|| StorageError::Corrupted("insert produced no id".into()))
    }

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<Vec<Value>> {
        self.write(|s| s.plan_insert(database, collection, documents))
    }

    fn find(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.state.read().find(database, collection, filter, None)
    }

    fn find_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
    ) -> StorageResult<Option<Document>> {
        Ok(self
            .state
            .read()
            .find(database, collection, filter, Some(1))?
            .pop())
    }

    fn find_by_id(&self, database: &str, collection: &str, id: &Value) -> StorageResult<Option<Document>> {
        Ok(self.state.read().find_by_id(database, collection, id))
    }

    fn replace_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(StorageError::invalid_update("replacement contains operators"));
        }
        self.write(|s| s.plan_update(database, collection, filter, replacement, upsert, false))
    }

    fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(|s| s.plan_update(database, collection, filter, update, upsert, false))
    }

    fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        self.write(|s| s.plan_update(database, collection, filter, update, upsert, true))
    }

    fn delete_one(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Option<Document>> {
        Ok(self
            .write(|s| s.plan_delete(database, collection, filter, false))?
            .pop())
    }

    fn delete_many(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        self.write(|s| s.plan_delete(database, collection, filter, true))
    }

    fn collection_names(&self, database: &str) -> StorageResult<Vec<String>> {
        Ok(self.state.read().collection_names(database))
    }

    fn database_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.read().database_names())
    }

    fn drop_collection(&self, database: &str, collection: &str) -> StorageResult<()> {
        self.write(|s| Ok((s.plan_drop(database, collection), ())))
    }
}
