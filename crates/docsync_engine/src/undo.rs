//! Undo journal for crash-safe local mutations.
//!
//! Before a synchronized document is written locally, its prior image (or a
//! null tombstone when it did not exist) is recorded here. The entry is
//! removed once the write and its bookkeeping are committed. Entries left
//! behind by a crash are restored by recovery on the next start.

use std::sync::Arc;

use docsync_codec::{doc, Document, Value};
use docsync_protocol::{MongoNamespace, ID_FIELD};
use docsync_storage::LocalStore;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::instance_config::{local_undo_database, local_user_database};

const PRIOR_FIELD: &str = "prior";

/// One leftover journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    /// `_id` of the journaled document.
    pub document_id: Value,
    /// Image before the mutation; `None` if the document did not exist.
    pub prior: Option<Document>,
}

/// The undo collection of one namespace.
#[derive(Clone)]
pub struct UndoJournal {
    store: Arc<dyn LocalStore>,
    namespace: MongoNamespace,
    database: String,
}

impl std::fmt::Debug for UndoJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoJournal")
            .field("namespace", &self.namespace)
            .field("database", &self.database)
            .finish()
    }
}

impl UndoJournal {
    /// Journal for `namespace` inside `store`.
    pub fn new(store: Arc<dyn LocalStore>, namespace: MongoNamespace) -> Self {
        let database = local_undo_database(&namespace);
        Self {
            store,
            namespace,
            database,
        }
    }

    /// Namespace of the journal.
    pub fn namespace(&self) -> &MongoNamespace {
        &self.namespace
    }

    /// Records the state of `document_id` before it is mutated.
    ///
    /// A second call for the same id keeps the first image.
    pub fn begin_undo(&self, document_id: &Value, prior: Option<&Document>) -> SyncResult<()> {
        let filter = doc! { ID_FIELD => document_id.clone() };
        if self.store.find_one(&self.database, &self.namespace.collection, &filter)?.is_some() {
            return Ok(());
        }
        let entry = doc! {
            ID_FIELD => document_id.clone(),
            PRIOR_FIELD => prior.cloned().map_or(Value::Null, Value::Document),
        };
        self.store
            .replace_one(&self.database, &self.namespace.collection, &filter, &entry, true)?;
        Ok(())
    }

    /// Releases the entry of `document_id`.
    pub fn commit_undo(&self, document_id: &Value) -> SyncResult<()> {
        let filter = doc! { ID_FIELD => document_id.clone() };
        self.store.delete_one(&self.database, &self.namespace.collection, &filter)?;
        Ok(())
    }

    /// Puts `prior` back into the user collection and releases the entry.
    ///
    /// Used when a local write succeeded but its bookkeeping did not. If the
    /// restore itself fails the entry stays for recovery.
    pub(crate) fn roll_back(&self, document_id: &Value, prior: Option<&Document>) {
        let user_database = local_user_database(&self.namespace);
        let filter = doc! { ID_FIELD => document_id.clone() };
        let restored = match prior {
            Some(prior) => self
                .store
                .replace_one(&user_database, &self.namespace.collection, &filter, prior, true)
                .map(|_| ()),
            None => self
                .store
                .delete_one(&user_database, &self.namespace.collection, &filter)
                .map(|_| ()),
        };
        match restored.map_err(SyncError::from).and_then(|()| self.commit_undo(document_id)) {
            Ok(()) => debug!(ns = %self.namespace, document_id = %document_id, "local write rolled back"),
            Err(e) => warn!(
                ns = %self.namespace,
                document_id = %document_id,
                error = %e,
                "rollback failed, leaving undo entry for recovery"
            ),
        }
    }

    /// Every leftover entry.
    pub fn entries(&self) -> SyncResult<Vec<UndoEntry>> {
        self.store
            .find(&self.database, &self.namespace.collection, &Document::new())?
            .into_iter()
            .map(|record| {
                let document_id = record
                    .get(ID_FIELD)
                    .cloned()
                    .ok_or_else(|| SyncError::decoding("undo entry is missing _id"))?;
                let prior = match record.get(PRIOR_FIELD) {
                    None | Some(Value::Null) => None,
                    Some(Value::Document(d)) => Some(d.clone()),
                    Some(other) => {
                        return Err(SyncError::decoding(format!(
                            "undo entry prior must be a document, found {}",
                            other.type_name()
                        )))
                    }
                };
                Ok(UndoEntry { document_id, prior })
            })
            .collect()
    }

    /// Removes every entry.
    pub fn clear(&self) -> SyncResult<()> {
        self.store
            .delete_many(&self.database, &self.namespace.collection, &Document::new())?;
        Ok(())
    }

    /// True when no mutation is in flight or leaked.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self
            .store
            .count(&self.database, &self.namespace.collection, &Document::new())?
            == 0)
    }

    /// Fails with `ConsistencyViolation` when any entry is left.
    pub fn verify_empty(&self) -> SyncResult<()> {
        let leftover = self
            .store
            .count(&self.database, &self.namespace.collection, &Document::new())?;
        if leftover == 0 {
            Ok(())
        } else {
            Err(SyncError::consistency(format!(
                "undo collection for {} holds {leftover} entries",
                self.namespace
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_storage::MemoryStore;

    fn journal() -> UndoJournal {
        UndoJournal::new(Arc::new(MemoryStore::new()), MongoNamespace::new("db", "c"))
    }

    #[test]
    fn begin_and_commit() {
        let journal = journal();
        journal.verify_empty().unwrap();
        journal
            .begin_undo(&Value::from(1), Some(&doc! { "_id" => 1, "a" => 1 }))
            .unwrap();
        journal.begin_undo(&Value::from(2), None).unwrap();
        assert!(!journal.is_empty().unwrap());
        assert!(matches!(
            journal.verify_empty(),
            Err(SyncError::ConsistencyViolation { .. })
        ));

        let mut entries = journal.entries().unwrap();
        entries.sort_by(|a, b| a.document_id.compare(&b.document_id));
        assert_eq!(entries[0].prior, Some(doc! { "_id" => 1, "a" => 1 }));
        assert_eq!(entries[1].prior, None);

        journal.commit_undo(&Value::from(1)).unwrap();
        journal.commit_undo(&Value::from(2)).unwrap();
        journal.verify_empty().unwrap();
    }

    #[test]
    fn first_image_is_kept() {
        let journal = journal();
        journal.begin_undo(&Value::from(1), None).unwrap();
        journal
            .begin_undo(&Value::from(1), Some(&doc! { "_id" => 1, "a" => 2 }))
            .unwrap();
        assert_eq!(journal.entries().unwrap()[0].prior, None);
    }

    #[test]
    fn roll_back_restores_prior_and_releases_entry() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let namespace = MongoNamespace::new("db", "c");
        let journal = UndoJournal::new(store.clone(), namespace.clone());
        let user_database = local_user_database(&namespace);
        let prior = doc! { "_id" => 1, "a" => 1 };

        journal.begin_undo(&Value::from(1), Some(&prior)).unwrap();
        store
            .replace_one(&user_database, "c", &doc! { "_id" => 1 }, &doc! { "_id" => 1, "a" => 2 }, true)
            .unwrap();
        journal.roll_back(&Value::from(1), Some(&prior));
        assert_eq!(store.find_one(&user_database, "c", &doc! { "_id" => 1 }).unwrap(), Some(prior));

        journal.begin_undo(&Value::from(2), None).unwrap();
        store.insert_one(&user_database, "c", doc! { "_id" => 2 }).unwrap();
        journal.roll_back(&Value::from(2), None);
        assert_eq!(store.find_one(&user_database, "c", &doc! { "_id" => 2 }).unwrap(), None);
        journal.verify_empty().unwrap();
    }

    #[test]
    fn journals_are_per_collection() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let first = UndoJournal::new(store.clone(), MongoNamespace::new("db", "a"));
        let second = UndoJournal::new(store, MongoNamespace::new("db", "b"));
        first.begin_undo(&Value::from(1), None).unwrap();
        assert!(second.is_empty().unwrap());
        first.clear().unwrap();
        assert!(first.is_empty().unwrap());
    }
}
