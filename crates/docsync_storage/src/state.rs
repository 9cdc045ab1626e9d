//! In-memory collection state shared by the store implementations.
//!
//! Every write is split in two: a read-only `plan_*` step validates the
//! operation and produces the [`Mutation`]s it implies, and [`StoreState::apply`]
//! makes them visible. Durable stores log the mutations between the two.

use std::collections::{BTreeMap, HashMap};

use docsync_codec::{Document, ObjectId, Value};

use crate::error::{StorageError, StorageResult};
use crate::query::matches;
use crate::store::{DocumentChange, UpdateOutcome};
use crate::update::{apply_update, is_operator_update, upsert_seed};

const ID_FIELD: &str = "_id";

/// A single state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or overwrite the document with the same `_id`.
    Put {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Full document, including `_id`.
        document: Document,
    },
    /// Remove the document with this `_id`.
    Delete {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// The removed `_id`.
        id: Value,
    },
    /// Remove a whole collection.
    Drop {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
    },
}

#[derive(Debug, Default, Clone)]
struct Collection {
    next_seq: u64,
    by_seq: BTreeMap<u64, Document>,
    seq_of: HashMap<Value, u64>,
}

impl Collection {
    fn documents(&self) -> impl Iterator<Item = &Document> {
        self.by_seq.values()
    }

    fn get(&self, id: &Value) -> Option<&Document> {
        self.seq_of.get(id).and_then(|seq| self.by_seq.get(seq))
    }

    fn put(&mut self, document: Document) {
        let id = document.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        match self.seq_of.get(&id) {
            Some(seq) => {
                self.by_seq.insert(*seq, document);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.seq_of.insert(id, seq);
                self.by_seq.insert(seq, document);
            }
        }
    }

    fn delete(&mut self, id: &Value) {
        if let Some(seq) = self.seq_of.remove(id) {
            self.by_seq.remove(&seq);
        }
    }
}

/// All collections of a store, keyed by `(database, collection)`.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    collections: BTreeMap<(String, String), Collection>,
}

fn key(database: &str, collection: &str) -> (String, String) {
    (database.to_string(), collection.to_string())
}

fn ensure_id(document: Document) -> Document {
    if !document.contains_key(ID_FIELD) {
        let mut with_id = Document::with_capacity(document.len() + 1);
        with_id.insert(ID_FIELD, ObjectId::new());
        for (k, v) in document {
            with_id.insert(k, v);
        }
        return with_id;
    }
    document
}

impl StoreState {
    fn collection(&self, database: &str, collection: &str) -> Option<&Collection> {
        self.collections.get(&key(database, collection))
    }

    pub(crate) fn apply(&mut self, mutations: Vec<Mutation>) {
        for mutation in mutations {
            match mutation {
                Mutation::Put {
                    database,
                    collection,
                    document,
                } => self
                    .collections
                    .entry((database, collection))
                    .or_default()
                    .put(document),
                Mutation::Delete {
                    database,
                    collection,
                    id,
                } => {
                    if let Some(c) = self.collections.get_mut(&(database, collection)) {
                        c.delete(&id);
                    }
                }
                Mutation::Drop {
                    database,
                    collection,
                } => {
                    self.collections.remove(&(database, collection));
                }
            }
        }
    }

    /// Mutations that recreate the current state from nothing.
    pub(crate) fn snapshot(&self) -> Vec<Mutation> {
        self.collections
            .iter()
            .flat_map(|((db, coll), c)| {
                c.documents().map(move |d| Mutation::Put {
                    database: db.clone(),
                    collection: coll.clone(),
                    document: d.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn find(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Document>> {
        let Some(c) = self.collection(database, collection) else {
            return Ok(Vec::new());
        };
        if let Some(id) = single_id(filter) {
            return Ok(c.get(id).cloned().into_iter().collect());
        }
        let mut found = Vec::new();
        for document in c.documents() {
            if limit.is_some_and(|l| found.len() >= l) {
                break;
            }
            if matches(document, filter)? {
                found.push(document.clone());
            }
        }
        Ok(found)
    }

    pub(crate) fn find_by_id(&self, database: &str, collection: &str, id: &Value) -> Option<Document> {
        self.collection(database, collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub(crate) fn collection_names(&self, database: &str) -> Vec<String> {
        self.collections
            .iter()
            .filter(|((db, _), c)| db == database && !c.by_seq.is_empty())
            .map(|((_, coll), _)| coll.clone())
            .collect()
    }

    pub(crate) fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter(|(_, c)| !c.by_seq.is_empty())
            .map(|((db, _), _)| db.clone())
            .collect();
        names.dedup();
        names
    }

    pub(crate) fn plan_insert(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<(Vec<Mutation>, Vec<Value>)> {
        let existing = self.collection(database, collection);
        let mut mutations = Vec::with_capacity(documents.len());
        let mut ids: Vec<Value> = Vec::with_capacity(documents.len());
        for document in documents {
            let document = ensure_id(document);
            let id = document.get(ID_FIELD).cloned().unwrap_or(Value::Null);
            if existing.is_some_and(|c| c.get(&id).is_some()) || ids.contains(&id) {
                return Err(StorageError::DuplicateKey {
                    collection: format!("{database}.{collection}"),
                    id: id.to_string(),
                });
            }
            ids.push(id);
            mutations.push(Mutation::Put {
                database: database.to_string(),
                collection: collection.to_string(),
                document,
            });
        }
        Ok((mutations, ids))
    }

    pub(crate) fn plan_update(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> StorageResult<(Vec<Mutation>, UpdateOutcome)> {
        let limit = if multi { None } else { Some(1) };
        let targets = self.find(database, collection, filter, limit)?;
        let mut outcome = UpdateOutcome::default();
        let mut mutations = Vec::new();

        if targets.is_empty() {
            if !upsert {
                return Ok((mutations, outcome));
            }
            let seed = upsert_seed(filter)?;
            let created = if is_operator_update(update) {
                apply_update(&seed, update)?
            } else {
                let mut replacement = update.clone();
                if let Some(id) = seed.get(ID_FIELD) {
                    if !replacement.contains_key(ID_FIELD) {
                        replacement.insert(ID_FIELD, id.clone());
                    }
                }
                replacement
            };
            let created = ensure_id(created);
            let (insert, mut ids) = self.plan_insert(database, collection, vec![created.clone()])?;
            outcome.upserted_id = ids.pop();
            outcome.changes.push(DocumentChange {
                before: None,
                after: created,
            });
            return Ok((insert, outcome));
        }

        for before in targets {
            outcome.matched_count += 1;
            let after = apply_update(&before, update)?;
            if after != before {
                outcome.modified_count += 1;
                mutations.push(Mutation::Put {
                    database: database.to_string(),
                    collection: collection.to_string(),
                    document: after.clone(),
                });
            }
            outcome.changes.push(DocumentChange {
                before: Some(before),
                after,
            });
        }
        Ok((mutations, outcome))
    }

    pub(crate) fn plan_delete(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        multi: bool,
    ) -> StorageResult<(Vec<Mutation>, Vec<Document>)> {
        let limit = if multi { None } else { Some(1) };
        let targets = self.find(database, collection, filter, limit)?;
        let mutations = targets
            .iter()
            .map(|d| Mutation::Delete {
                database: database.to_string(),
                collection: collection.to_string(),
                id: d.get(ID_FIELD).cloned().unwrap_or(Value::Null),
            })
            .collect();
        Ok((mutations, targets))
    }

    pub(crate) fn plan_drop(&self, database: &str, collection: &str) -> Vec<Mutation> {
        if self.collection(database, collection).is_none() {
            return Vec::new();
        }
        vec![Mutation::Drop {
            database: database.to_string(),
            collection: collection.to_string(),
        }]
    }
}

/// `Some(id)` when the filter is exactly `{_id: <plain value>}`.
fn single_id(filter: &Document) -> Option<&Value> {
    if filter.len() != 1 {
        return None;
    }
    let id = filter.get(ID_FIELD)?;
    if matches!(id, Value::Document(_)) || id.is_number() {
        return None;
    }
    Some(id)
}
