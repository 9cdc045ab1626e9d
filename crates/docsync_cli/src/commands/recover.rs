//! Recover command implementation.

use std::path::Path;

use docsync_engine::{recover_local_state, ConfigStore, UndoJournal};

use super::{instance_keys, open_store};

/// Runs the recover command.
pub fn run(path: &Path, instance_key: Option<&str>, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let keys = instance_keys(store.as_ref(), instance_key)?;
    if keys.is_empty() {
        println!("No sync instances found.");
        return Ok(());
    }

    for key in &keys {
        println!("Instance: {key}");
        if dry_run {
            let instance = ConfigStore::new(store.clone(), key).load()?;
            for ns_config in instance.namespaces() {
                let entries = UndoJournal::new(store.clone(), ns_config.namespace().clone()).entries()?;
                for entry in entries {
                    let action = if entry.prior.is_some() { "restore" } else { "delete" };
                    println!("  would {action} {} in {}", entry.document_id, ns_config.namespace());
                }
            }
            continue;
        }
        let report = recover_local_state(store.clone(), key)?;
        println!("  undo entries rolled back: {}", report.restored);
        println!("  unsynchronized documents removed: {}", report.removed);
    }
    Ok(())
}
