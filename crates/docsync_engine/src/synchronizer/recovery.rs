//! Startup recovery of interrupted local writes.
//!
//! For every namespace:
//!
//! 1. Documents with a leftover undo entry are restored to their prior image.
//! 2. Those with a pending write get it re-applied from the recorded event;
//!    the others are marked stale so the next pass re-fetches them.
//! 3. The undo journal is cleared.
//! 4. Local documents that are no longer synchronized are deleted.

use docsync_codec::{doc, Value};
use docsync_protocol::{sanitize_document, OperationType, ID_FIELD};
use tracing::{info, warn};

use super::EngineState;
use crate::error::SyncResult;
use crate::instance_config::local_user_database;
use crate::undo::UndoJournal;

/// What a recovery run changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Undo entries rolled back.
    pub restored: usize,
    /// Local documents deleted because they were no longer synchronized.
    pub removed: usize,
}

pub(super) fn recover(state: &mut EngineState) -> SyncResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let EngineState {
        store,
        config_store,
        instance,
    } = state;
    for ns_config in instance.namespaces_mut() {
        let namespace = ns_config.namespace().clone();
        let collection = namespace.collection.as_str();
        let user_database = local_user_database(&namespace);
        let journal = UndoJournal::new(store.clone(), namespace.clone());

        let entries = journal.entries()?;
        if !entries.is_empty() {
            warn!(ns = %namespace, entries = entries.len(), "recovering interrupted writes");
        }
        for entry in &entries {
            let filter = doc! { ID_FIELD => entry.document_id.clone() };
            match &entry.prior {
                Some(prior) => {
                    store.replace_one(&user_database, collection, &filter, prior, true)?;
                }
                None => {
                    store.delete_one(&user_database, collection, &filter)?;
                }
            }
        }
        for entry in &entries {
            let Some(config) = ns_config.get_mut(&entry.document_id) else {
                continue;
            };
            let filter = doc! { ID_FIELD => entry.document_id.clone() };
            match config.uncommitted_change_event() {
                Some(pending) => match (pending.operation_type, &pending.full_document) {
                    (OperationType::Delete, _) => {
                        store.delete_one(&user_database, collection, &filter)?;
                    }
                    (OperationType::Unknown, _) | (_, None) => {}
                    (_, Some(full)) => {
                        store.replace_one(&user_database, collection, &filter, &sanitize_document(full), true)?;
                    }
                },
                None => {
                    config.forget_hash();
                    config.set_stale(true);
                    config_store.save_document(config)?;
                }
            }
        }
        journal.clear()?;
        report.restored += entries.len();

        let synced = ns_config.synced_ids();
        let orphans = store.delete_many(
            &user_database,
            collection,
            &doc! { ID_FIELD => doc! { "$nin" => Value::Array(synced) } },
        )?;
        report.removed += orphans.len();
        if !orphans.is_empty() {
            info!(ns = %namespace, removed = orphans.len(), "removed unsynchronized local documents");
        }
    }
    Ok(report)
}
