//! Dump events command implementation.

use std::path::Path;
use std::sync::Arc;

use docsync_engine::ConfigStore;
use docsync_protocol::MongoNamespace;
use docsync_storage::LocalStore;
use serde::Serialize;

use super::{instance_keys, open_store};

/// A pending change event for output.
#[derive(Debug, Serialize)]
pub struct PendingEventInfo {
    /// Instance key.
    pub instance_key: String,
    /// Namespace as `database.collection`.
    pub namespace: String,
    /// Whether the document is paused.
    pub paused: bool,
    /// Logical time of the write.
    pub last_resolution: i64,
    /// The event in compact form.
    pub event: serde_json::Value,
}

/// Pending events of every instance in `keys`, optionally for one namespace.
pub fn pending_events(
    store: &Arc<dyn LocalStore>,
    keys: &[String],
    namespace: Option<&MongoNamespace>,
    limit: Option<usize>,
) -> Result<Vec<PendingEventInfo>, Box<dyn std::error::Error>> {
    let max_events = limit.unwrap_or(usize::MAX);
    let mut events = Vec::new();
    for key in keys {
        let instance = ConfigStore::new(store.clone(), key).load()?;
        for ns_config in instance.namespaces() {
            if namespace.is_some_and(|ns| ns != ns_config.namespace()) {
                continue;
            }
            for config in ns_config.documents() {
                if events.len() >= max_events {
                    return Ok(events);
                }
                let Some(event) = config.uncommitted_change_event() else {
                    continue;
                };
                let version = config.version_info()?.version().cloned();
                let compact = event.to_compact(config.last_known_hash(), version);
                events.push(PendingEventInfo {
                    instance_key: key.clone(),
                    namespace: ns_config.namespace().to_string(),
                    paused: config.is_paused(),
                    last_resolution: config.last_resolution(),
                    event: serde_json::to_value(compact.to_document())?,
                });
            }
        }
    }
    Ok(events)
}

/// Runs the dump-events command.
pub fn run(
    path: &Path,
    instance_key: Option<&str>,
    namespace: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespace = namespace
        .map(|n| MongoNamespace::parse(n).ok_or_else(|| format!("Invalid namespace {n:?}; expected database.collection")))
        .transpose()?;
    let store = open_store(path)?;
    let keys = instance_keys(store.as_ref(), instance_key)?;
    let events = pending_events(&store, &keys, namespace.as_ref(), limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        _ => {
            print_text_output(&events);
        }
    }

    Ok(())
}

fn print_text_output(events: &[PendingEventInfo]) {
    if events.is_empty() {
        println!("No pending events.");
        return;
    }
    println!("{:<24} {:<24} {:>6} {:<8} EVENT", "INSTANCE", "NAMESPACE", "TIME", "PAUSED");
    for info in events {
        println!(
            "{:<24} {:<24} {:>6} {:<8} {}",
            info.instance_key,
            info.namespace,
            info.last_resolution,
            if info.paused { "yes" } else { "no" },
            info.event
        );
    }
    println!();
    println!("Total: {} events", events.len());
}
