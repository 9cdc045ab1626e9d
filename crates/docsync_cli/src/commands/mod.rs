//! CLI command implementations.

pub mod dump_events;
pub mod inspect;
pub mod recover;
pub mod verify;

use std::path::Path;
use std::sync::Arc;

use docsync_engine::local_config_database;
use docsync_storage::{FileStore, LocalStore};

/// Opens the store at `path`, failing when it does not exist.
pub fn open_store(path: &Path) -> Result<Arc<dyn LocalStore>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(Arc::new(FileStore::open(path)?))
}

/// The explicit instance key, or every instance with bookkeeping in `store`.
pub fn instance_keys(
    store: &dyn LocalStore,
    explicit: Option<&str>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if let Some(key) = explicit {
        return Ok(vec![key.to_string()]);
    }
    let prefix = local_config_database("");
    let mut keys: Vec<String> = store
        .database_names()?
        .into_iter()
        .filter_map(|db| db.strip_prefix(&prefix).map(str::to_string))
        .collect();
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;
    use docsync_storage::MemoryStore;

    #[test]
    fn discovers_instance_keys() {
        let store = MemoryStore::new();
        store.insert_one(&local_config_database("app_b"), "namespaces", doc! { "_id" => "x" }).unwrap();
        store.insert_one(&local_config_database("app_a"), "namespaces", doc! { "_id" => "x" }).unwrap();
        store.insert_one("sync_user_db", "c", doc! { "_id" => 1 }).unwrap();
        assert_eq!(instance_keys(&store, None).unwrap(), vec!["app_a", "app_b"]);
        assert_eq!(instance_keys(&store, Some("k")).unwrap(), vec!["k"]);
    }
}
