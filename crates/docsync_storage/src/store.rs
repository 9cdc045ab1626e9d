//! The local store trait.

use docsync_codec::{Document, Value};

use crate::error::StorageResult;

/// Before and after images of one document touched by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// The document before the update; `None` when it was upserted.
    pub before: Option<Document>,
    /// The document after the update.
    pub after: Document,
}

/// Result of an update or replace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter.
    pub matched_count: u64,
    /// Documents whose content changed.
    pub modified_count: u64,
    /// `_id` of the upserted document, if one was created.
    pub upserted_id: Option<Value>,
    /// Per-document images, in match order.
    pub changes: Vec<DocumentChange>,
}

/// A document-oriented local persistent store.
///
/// Collections are addressed by `(database, collection)` and created
/// implicitly on first write. Every document has a unique `_id`; inserts
/// without one receive an [`docsync_codec::ObjectId`].
///
/// # Invariants
///
/// - A successful write is visible to every subsequent read
/// - A failed write leaves the store unchanged
/// - Implementations must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For tests and ephemeral engines
/// - [`super::FileStore`] - For state that must survive restarts
pub trait LocalStore: Send + Sync {
    /// Inserts one document and returns its `_id`.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateKey` when the `_id` is taken.
    fn insert_one(&self, database: &str, collection: &str, document: Document) -> StorageResult<Value>;

    /// Inserts all documents or none of them.
    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<Vec<Value>>;

    /// Every document matching `filter`, in insertion order.
    fn find(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>>;

    /// The first document matching `filter`.
    fn find_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
    ) -> StorageResult<Option<Document>> {
        Ok(self.find(database, collection, filter)?.into_iter().next())
    }

    /// The document with the given `_id`.
    fn find_by_id(&self, database: &str, collection: &str, id: &Value) -> StorageResult<Option<Document>>;

    /// Number of documents matching `filter`.
    fn count(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<u64> {
        Ok(self.find(database, collection, filter)?.len() as u64)
    }

    /// Replaces the first match, keeping its `_id`.
    fn replace_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome>;

    /// Applies an update document to the first match.
    fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome>;

    /// Applies an update document to every match.
    fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome>;

    /// Deletes the first match, returning it.
    fn delete_one(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Option<Document>>;

    /// Deletes every match, returning them.
    fn delete_many(&self, database: &str, collection: &str, filter: &Document) -> StorageResult<Vec<Document>>;

    /// Non-empty collections of a database.
    fn collection_names(&self, database: &str) -> StorageResult<Vec<String>>;

    /// Databases that hold at least one document.
    fn database_names(&self) -> StorageResult<Vec<String>>;

    /// Removes a collection and all of its documents.
    fn drop_collection(&self, database: &str, collection: &str) -> StorageResult<()>;
}
