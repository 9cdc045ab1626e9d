//! Instance-wide bookkeeping and local database naming.

use std::collections::BTreeMap;
use std::sync::Arc;

use docsync_codec::{doc, Document, Value};
use docsync_protocol::{MongoNamespace, ID_FIELD};
use docsync_storage::LocalStore;

use crate::doc_config::{record_id, DocumentSynchronization};
use crate::error::SyncResult;
use crate::ns_config::NamespaceSynchronization;

const NAMESPACES_COLLECTION: &str = "namespaces";
const DOCUMENTS_COLLECTION: &str = "documents";

/// Local database holding the synchronized copies of `namespace`.
pub fn local_user_database(namespace: &MongoNamespace) -> String {
    format!("sync_user_{}", namespace.database)
}

/// Local database holding the undo journal of `namespace`.
pub fn local_undo_database(namespace: &MongoNamespace) -> String {
    format!("sync_undo_{}", namespace.database)
}

/// Local database holding the bookkeeping of one engine instance.
pub fn local_config_database(instance_key: &str) -> String {
    format!("sync_config_{}", instance_key.replace('/', "_"))
}

/// Reads and writes bookkeeping records in the instance's config database.
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn LocalStore>,
    database: String,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").field("database", &self.database).finish()
    }
}

impl ConfigStore {
    /// Bookkeeping for `instance_key` inside `store`.
    pub fn new(store: Arc<dyn LocalStore>, instance_key: &str) -> Self {
        Self {
            store,
            database: local_config_database(instance_key),
        }
    }

    /// Name of the config database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Upserts a namespace record.
    pub fn save_namespace(&self, config: &NamespaceSynchronization) -> SyncResult<()> {
        let filter = doc! { ID_FIELD => config.namespace().to_string() };
        self.store
            .replace_one(&self.database, NAMESPACES_COLLECTION, &filter, &config.to_document(), true)?;
        Ok(())
    }

    /// Upserts a document record.
    pub fn save_document(&self, config: &DocumentSynchronization) -> SyncResult<()> {
        let filter = doc! { ID_FIELD => config.record_id() };
        self.store
            .replace_one(&self.database, DOCUMENTS_COLLECTION, &filter, &config.to_document(), true)?;
        Ok(())
    }

    /// Removes a document record.
    pub fn delete_document(&self, namespace: &MongoNamespace, document_id: &Value) -> SyncResult<()> {
        let filter = doc! { ID_FIELD => record_id(namespace, document_id) };
        self.store.delete_one(&self.database, DOCUMENTS_COLLECTION, &filter)?;
        Ok(())
    }

    /// Loads every namespace with its documents.
    pub fn load(&self) -> SyncResult<InstanceSynchronization> {
        let mut instance = InstanceSynchronization::default();
        for record in self.store.find(&self.database, NAMESPACES_COLLECTION, &Document::new())? {
            let config = NamespaceSynchronization::from_document(&record)?;
            instance.namespaces.insert(config.namespace().clone(), config);
        }
        for record in self.store.find(&self.database, DOCUMENTS_COLLECTION, &Document::new())? {
            let config = DocumentSynchronization::from_document(&record)?;
            instance
                .namespaces
                .entry(config.namespace().clone())
                .or_insert_with(|| NamespaceSynchronization::new(config.namespace().clone()))
                .insert(config);
        }
        Ok(instance)
    }
}

/// Every namespace known to one engine instance.
#[derive(Debug, Default)]
pub struct InstanceSynchronization {
    namespaces: BTreeMap<MongoNamespace, NamespaceSynchronization>,
}

impl InstanceSynchronization {
    /// The namespace's bookkeeping, if it exists.
    pub fn get(&self, namespace: &MongoNamespace) -> Option<&NamespaceSynchronization> {
        self.namespaces.get(namespace)
    }

    pub(crate) fn get_mut(&mut self, namespace: &MongoNamespace) -> Option<&mut NamespaceSynchronization> {
        self.namespaces.get_mut(namespace)
    }

    /// The namespace's bookkeeping, created if needed.
    ///
    /// Returns whether the namespace was created.
    pub(crate) fn get_or_create(&mut self, namespace: &MongoNamespace) -> (&mut NamespaceSynchronization, bool) {
        let mut created = false;
        let config = self.namespaces.entry(namespace.clone()).or_insert_with(|| {
            created = true;
            NamespaceSynchronization::new(namespace.clone())
        });
        (config, created)
    }

    /// Known namespaces, in order.
    pub fn namespaces(&self) -> impl Iterator<Item = &NamespaceSynchronization> {
        self.namespaces.values()
    }

    pub(crate) fn namespaces_mut(&mut self) -> impl Iterator<Item = &mut NamespaceSynchronization> {
        self.namespaces.values_mut()
    }

    /// Largest logical time recorded by any document.
    pub fn max_last_resolution(&self) -> i64 {
        self.namespaces
            .values()
            .flat_map(|ns| ns.documents())
            .map(DocumentSynchronization::last_resolution)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::ChangeEvent;
    use docsync_storage::MemoryStore;

    #[test]
    fn database_names() {
        let ns = MongoNamespace::new("shop", "orders");
        assert_eq!(local_user_database(&ns), "sync_user_shop");
        assert_eq!(local_undo_database(&ns), "sync_undo_shop");
        assert_eq!(local_config_database("app/user-1"), "sync_config_app_user-1");
    }

    #[test]
    fn save_and_load() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let config = ConfigStore::new(store.clone(), "k");
        let ns = MongoNamespace::new("db", "c");

        let mut ns_config = NamespaceSynchronization::new(ns.clone());
        ns_config.set_resume_token(Some(Value::Int64(3)));
        config.save_namespace(&ns_config).unwrap();

        let mut doc_config = DocumentSynchronization::new(ns.clone(), Value::from(7));
        doc_config
            .set_some_pending_writes_and_save(
                &config,
                5,
                ChangeEvent::for_local_insert(&ns, &Value::from(7), &doc! { "_id" => 7 }, true),
            )
            .unwrap();
        config.save_document(&DocumentSynchronization::new(ns.clone(), Value::from(8))).unwrap();
        config.delete_document(&ns, &Value::from(8)).unwrap();

        let loaded = config.load().unwrap();
        let loaded_ns = loaded.get(&ns).unwrap();
        assert_eq!(loaded_ns.resume_token(), Some(&Value::Int64(3)));
        assert_eq!(loaded_ns.synced_ids(), vec![Value::from(7)]);
        assert!(loaded_ns.get(&Value::from(7)).unwrap().has_uncommitted_writes());
        assert_eq!(loaded.max_last_resolution(), 5);
    }

    #[test]
    fn instances_are_isolated() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let ns = MongoNamespace::new("db", "c");
        ConfigStore::new(store.clone(), "a")
            .save_document(&DocumentSynchronization::new(ns.clone(), Value::from(1)))
            .unwrap();
        let other = ConfigStore::new(store, "b").load().unwrap();
        assert!(other.get(&ns).is_none());
    }
}
