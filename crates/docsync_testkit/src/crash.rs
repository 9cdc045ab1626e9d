//! Crash recovery testing for docsync.
//!
//! Simulates a process dying in the middle of a local write: the undo
//! journal holds an entry and the user collection holds a half-applied
//! change. Reopening the engine must roll the store back to a state
//! consistent with the bookkeeping.
//!
//! ## Test Strategy
//!
//! 1. **Interrupted remote apply** - the prior image is restored and the
//!    document is re-fetched
//! 2. **Interrupted local write** - the pending write is re-applied
//! 3. **Orphaned documents** - local documents without bookkeeping are removed

use docsync_codec::{doc, Document, Value};
use docsync_engine::{local_user_database, UndoJournal};

use crate::fixtures::TestEngine;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After the undo entry was written, before the user collection changed.
    AfterJournal,
    /// After the user collection changed, before the undo entry was removed.
    AfterLocalWrite,
}

/// Leaves `t` as if the process died while writing `replacement` over
/// document `id` at `point`.
///
/// A `None` replacement simulates an interrupted delete.
pub fn simulate_interrupted_write(
    t: &TestEngine,
    id: impl Into<Value>,
    replacement: Option<Document>,
    point: CrashPoint,
) {
    let id = id.into();
    let database = local_user_database(&t.namespace);
    let collection = &t.namespace.collection;
    let prior = t
        .store
        .find_by_id(&database, collection, &id)
        .expect("Failed to read local document");
    UndoJournal::new(t.store.clone(), t.namespace.clone())
        .begin_undo(&id, prior.as_ref())
        .expect("Failed to write undo entry");
    if point == CrashPoint::AfterJournal {
        return;
    }
    let filter = doc! { "_id" => id };
    match replacement {
        Some(document) => {
            t.store
                .replace_one(&database, collection, &filter, &document, true)
                .expect("Failed to write local document");
        }
        None => {
            t.store
                .delete_one(&database, collection, &filter)
                .expect("Failed to delete local document");
        }
    }
}

/// Writes a local document without any bookkeeping.
pub fn plant_orphan(t: &TestEngine, document: Document) {
    t.store
        .insert_one(&local_user_database(&t.namespace), &t.namespace.collection, document)
        .expect("Failed to insert orphan");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scenarios::synced_engine_with;
    use docsync_engine::{recover_local_state, DocumentState};

    #[test]
    fn test_interrupted_remote_apply_is_rolled_back() {
        let t = synced_engine_with(1, TestEngine::file());
        simulate_interrupted_write(
            &t,
            0,
            Some(doc! { "_id" => 0, "n" => 99 }),
            CrashPoint::AfterLocalWrite,
        );

        let t = t.reopen();
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        t.assert_undo_empty();
        let config = t.document_config(&t.namespace, &Value::from(0)).unwrap();
        assert!(config.is_stale());

        t.pass();
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        assert_eq!(t.state(0), DocumentState::Synced);
    }

    #[test]
    fn test_interrupted_delete_is_rolled_back() {
        let t = synced_engine_with(2, TestEngine::file());
        simulate_interrupted_write(&t, 1, None, CrashPoint::AfterLocalWrite);
        assert_eq!(t.local(1), None);

        let t = t.reopen();
        assert_eq!(t.local(1), Some(doc! { "_id" => 1, "n" => 1 }));
        t.assert_undo_empty();
    }

    #[test]
    fn test_pending_insert_survives_crash() {
        let t = TestEngine::file();
        t.insert_one(&t.namespace, doc! { "_id" => 5, "title" => "draft" })
            .unwrap();
        simulate_interrupted_write(
            &t,
            5,
            Some(doc! { "_id" => 5, "title" => "garbage" }),
            CrashPoint::AfterLocalWrite,
        );

        let t = t.reopen();
        assert_eq!(t.local(5), Some(doc! { "_id" => 5, "title" => "draft" }));
        assert_eq!(t.state(5), DocumentState::PendingLocalWrite);

        t.pass();
        assert_eq!(t.remote_document(5), Some(doc! { "_id" => 5, "title" => "draft" }));
        assert_eq!(t.state(5), DocumentState::Synced);
    }

    #[test]
    fn test_crash_after_journal_changes_nothing() {
        let t = synced_engine_with(1, TestEngine::file());
        simulate_interrupted_write(&t, 0, None, CrashPoint::AfterJournal);

        let t = t.reopen();
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
        t.assert_undo_empty();
    }

    #[test]
    fn test_orphans_are_removed() {
        let t = synced_engine_with(1, TestEngine::file());
        plant_orphan(&t, doc! { "_id" => 77 });

        let t = t.reopen();
        assert_eq!(t.local(77), None);
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
    }

    #[test]
    fn test_recovery_without_engine() {
        let t = synced_engine_with(1, TestEngine::memory());
        simulate_interrupted_write(&t, 0, None, CrashPoint::AfterLocalWrite);
        plant_orphan(&t, doc! { "_id" => 78 });

        let report = recover_local_state(t.store.clone(), crate::fixtures::TEST_INSTANCE_KEY).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(t.local(0), Some(doc! { "_id" => 0, "n" => 0 }));
    }
}
