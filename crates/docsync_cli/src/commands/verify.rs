//! Verify command implementation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use docsync_codec::{Document, Value};
use docsync_engine::{local_user_database, ConfigStore, UndoJournal};
use docsync_protocol::{OperationType, ID_FIELD};
use docsync_storage::LocalStore;

use super::{instance_keys, open_store};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of namespaces checked.
    pub namespaces_checked: usize,
    /// Number of bookkeeping records checked.
    pub documents_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
    /// Findings that do not make the store inconsistent.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks every instance in `keys`.
pub fn verify(store: &Arc<dyn LocalStore>, keys: &[String]) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    for key in keys {
        let instance = ConfigStore::new(store.clone(), key).load()?;
        for ns_config in instance.namespaces() {
            let namespace = ns_config.namespace();
            result.namespaces_checked += 1;

            let undo = UndoJournal::new(store.clone(), namespace.clone()).entries()?;
            if !undo.is_empty() {
                result.errors.push(format!(
                    "{key}: {namespace}: {} undo entries left; run `docsync recover`",
                    undo.len()
                ));
            }

            let local = store.find(&local_user_database(namespace), &namespace.collection, &Document::new())?;
            let local_ids: HashSet<Value> = local.iter().filter_map(|d| d.get(ID_FIELD).cloned()).collect();
            for id in &local_ids {
                if ns_config.get(id).is_none() {
                    result
                        .errors
                        .push(format!("{key}: {namespace}: local document {id} has no bookkeeping"));
                }
            }

            for config in ns_config.documents() {
                result.documents_checked += 1;
                let id = config.document_id();
                if config.is_paused() {
                    result.warnings.push(format!("{key}: {namespace}: document {id} is paused"));
                }
                let Some(pending) = config.uncommitted_change_event() else {
                    continue;
                };
                let exists = local_ids.contains(id);
                match pending.operation_type {
                    OperationType::Delete if exists => result.errors.push(format!(
                        "{key}: {namespace}: document {id} has a pending delete but exists locally"
                    )),
                    OperationType::Insert | OperationType::Replace | OperationType::Update if !exists => {
                        result.errors.push(format!(
                            "{key}: {namespace}: document {id} has a pending {} but is missing locally",
                            pending.operation_type
                        ))
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path, instance_key: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let store = open_store(path)?;
    let keys = instance_keys(store.as_ref(), instance_key)?;
    let result = verify(&store, &keys)?;

    println!("Instances checked:  {}", keys.len());
    println!("Namespaces checked: {}", result.namespaces_checked);
    println!("Documents checked:  {}", result.documents_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
    println!();

    if result.is_ok() {
        println!("Verification passed.");
        Ok(())
    } else {
        Err(format!("Verification failed with {} errors", result.errors.len()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;
    use docsync_engine::{DataSynchronizer, MockRemoteService, SyncConfig};
    use docsync_protocol::{MongoNamespace, RemoteWins};
    use docsync_storage::MemoryStore;

    fn populated() -> (Arc<dyn LocalStore>, MongoNamespace) {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let engine = DataSynchronizer::new(
            SyncConfig::new("app").with_worker_enabled(false),
            store.clone(),
            Arc::new(MockRemoteService::new()),
        )
        .unwrap();
        let ns = MongoNamespace::new("db", "todo");
        engine.configure(&ns, Arc::new(RemoteWins), None, None).unwrap();
        engine.insert_one(&ns, doc! { "_id" => 1 }).unwrap();
        (store, ns)
    }

    #[test]
    fn clean_store_passes() {
        let (store, _) = populated();
        let result = verify(&store, &["app".to_string()]).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.documents_checked, 1);
    }

    #[test]
    fn leftover_undo_entry_fails() {
        let (store, ns) = populated();
        UndoJournal::new(store.clone(), ns)
            .begin_undo(&Value::from(1), None)
            .unwrap();
        let result = verify(&store, &["app".to_string()]).unwrap();
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("undo entries"));
    }

    #[test]
    fn missing_local_document_fails() {
        let (store, ns) = populated();
        store
            .delete_one(&local_user_database(&ns), &ns.collection, &doc! { "_id" => 1 })
            .unwrap();
        let result = verify(&store, &["app".to_string()]).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("missing locally"));
    }
}
