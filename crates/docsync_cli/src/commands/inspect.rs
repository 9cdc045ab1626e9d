//! Inspect command implementation.

use std::path::Path;
use std::sync::Arc;

use docsync_codec::Document;
use docsync_engine::{local_user_database, ConfigStore, DocumentState, UndoJournal};
use docsync_storage::LocalStore;
use serde::Serialize;

use super::{instance_keys, open_store};

/// State of one engine instance.
#[derive(Debug, Serialize)]
pub struct InstanceReport {
    /// Instance key.
    pub instance_key: String,
    /// Config database name.
    pub config_database: String,
    /// Per-namespace statistics.
    pub namespaces: Vec<NamespaceReport>,
}

/// Statistics for a single namespace.
#[derive(Debug, Serialize, PartialEq)]
pub struct NamespaceReport {
    /// Namespace as `database.collection`.
    pub namespace: String,
    /// Documents with bookkeeping.
    pub synced: usize,
    /// Documents with a pending local write.
    pub pending: usize,
    /// Documents paused after a failure.
    pub paused: usize,
    /// Documents to re-fetch on the next pass.
    pub stale: usize,
    /// Documents in the local user collection.
    pub local_documents: u64,
    /// Entries left in the undo journal.
    pub undo_entries: usize,
    /// Whether a change-stream resume token is stored.
    pub has_resume_token: bool,
}

/// Collects the state of every instance in `keys`.
pub fn inspect(
    store: &Arc<dyn LocalStore>,
    keys: &[String],
) -> Result<Vec<InstanceReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::with_capacity(keys.len());
    for key in keys {
        let config_store = ConfigStore::new(store.clone(), key);
        let instance = config_store.load()?;
        let mut namespaces = Vec::new();
        for ns_config in instance.namespaces() {
            let namespace = ns_config.namespace();
            let mut report = NamespaceReport {
                namespace: namespace.to_string(),
                synced: ns_config.len(),
                pending: 0,
                paused: 0,
                stale: ns_config.stale_ids().len(),
                local_documents: store.count(
                    &local_user_database(namespace),
                    &namespace.collection,
                    &Document::new(),
                )?,
                undo_entries: UndoJournal::new(store.clone(), namespace.clone()).entries()?.len(),
                has_resume_token: ns_config.resume_token().is_some(),
            };
            for config in ns_config.documents() {
                match config.state() {
                    DocumentState::PendingLocalWrite => report.pending += 1,
                    DocumentState::Paused => report.paused += 1,
                    DocumentState::Synced | DocumentState::NotTracked => {}
                }
            }
            namespaces.push(report);
        }
        reports.push(InstanceReport {
            instance_key: key.clone(),
            config_database: config_store.database().to_string(),
            namespaces,
        });
    }
    Ok(reports)
}

/// Runs the inspect command.
pub fn run(path: &Path, instance_key: Option<&str>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let keys = instance_keys(store.as_ref(), instance_key)?;
    let reports = inspect(&store, &keys)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => {
            print_text_output(path, &reports);
        }
    }

    Ok(())
}

fn print_text_output(path: &Path, reports: &[InstanceReport]) {
    println!("docsync Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", path.display());

    if reports.is_empty() {
        println!();
        println!("No sync instances found.");
        return;
    }

    for report in reports {
        println!();
        println!("Instance: {} ({})", report.instance_key, report.config_database);
        if report.namespaces.is_empty() {
            println!("  no namespaces");
        }
        for ns in &report.namespaces {
            println!("  {}", ns.namespace);
            println!("    synced:          {}", ns.synced);
            println!("    pending writes:  {}", ns.pending);
            println!("    paused:          {}", ns.paused);
            println!("    stale:           {}", ns.stale);
            println!("    local documents: {}", ns.local_documents);
            println!("    undo entries:    {}", ns.undo_entries);
            println!(
                "    resume token:    {}",
                if ns.has_resume_token { "yes" } else { "no" }
            );
        }
    }
}
