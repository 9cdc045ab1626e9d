//! Engines reopened over a file store, and random local edit sequences.

use std::path::Path;
use std::sync::Arc;

use docsync_codec::{doc, Document, Value};
use docsync_engine::{DataSynchronizer, DocumentState, MockRemoteService, SyncConfig};
use docsync_protocol::{sanitize_document, MongoNamespace, RemoteWins, ID_FIELD};
use docsync_storage::{FileStore, MemoryStore};
use proptest::prelude::*;
use tempfile::TempDir;

fn ns() -> MongoNamespace {
    MongoNamespace::new("db", "todo")
}

fn open_file_engine(dir: &Path, remote: &Arc<MockRemoteService>) -> DataSynchronizer {
    let engine = DataSynchronizer::new(
        SyncConfig::new("app/device").with_worker_enabled(false),
        Arc::new(FileStore::open(dir).unwrap()),
        remote.clone(),
    )
    .unwrap();
    engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();
    engine
}

fn by_id(mut documents: Vec<Document>) -> Vec<Document> {
    documents.sort_by(|a, b| match (a.get(ID_FIELD), b.get(ID_FIELD)) {
        (Some(a), Some(b)) => a.compare(b),
        _ => std::cmp::Ordering::Equal,
    });
    documents
}

#[test]
fn pending_writes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemoteService::new());
    {
        let engine = open_file_engine(dir.path(), &remote);
        engine.insert_one(&ns(), doc! { "_id" => 1, "n" => 1 }).unwrap();
        engine
            .update_one(&ns(), &doc! { "_id" => 1 }, &doc! { "$inc" => doc! { "n" => 1 } }, false)
            .unwrap();
        engine.close();
    }

    let engine = open_file_engine(dir.path(), &remote);
    assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::PendingLocalWrite);
    assert!(engine.do_sync_pass().unwrap());

    let pushed: Vec<Document> = remote.documents(&ns()).iter().map(sanitize_document).collect();
    assert_eq!(pushed, vec![doc! { "_id" => 1, "n" => 2 }]);
    assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::Synced);
    engine.verify_undo_collection_empty(&ns()).unwrap();
}

#[test]
fn deleted_document_stays_deleted_after_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemoteService::new());
    {
        let engine = open_file_engine(dir.path(), &remote);
        engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
        assert!(engine.do_sync_pass().unwrap());
        engine.delete_one(&ns(), &doc! { "_id" => 1 }).unwrap();
        engine.close();
    }

    let engine = open_file_engine(dir.path(), &remote);
    assert_eq!(engine.find_one(&ns(), &doc! { "_id" => 1 }).unwrap(), None);
    engine.do_sync_pass().unwrap();
    engine.do_sync_pass().unwrap();
    assert!(remote.documents(&ns()).is_empty());
    assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::NotTracked);
}

#[derive(Debug, Clone)]
enum Edit {
    Insert(i32),
    Set(i32, i32),
    Delete(i32),
    Pass,
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0..4i32).prop_map(Edit::Insert),
        (0..4i32, any::<i32>()).prop_map(|(id, n)| Edit::Set(id, n)),
        (0..4i32).prop_map(Edit::Delete),
        Just(Edit::Pass),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn local_edits_converge_with_remote(edits in proptest::collection::vec(arb_edit(), 1..24)) {
        let remote = Arc::new(MockRemoteService::new());
        let engine = DataSynchronizer::new(
            SyncConfig::new("app/device").with_worker_enabled(false),
            Arc::new(MemoryStore::new()),
            remote.clone(),
        )
        .unwrap();
        engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();

        for edit in edits {
            match edit {
                Edit::Insert(id) => {
                    if let Err(e) = engine.insert_one(&ns(), doc! { "_id" => id, "n" => 0 }) {
                        prop_assert!(e.is_duplicate_key(), "{}", e);
                    }
                }
                Edit::Set(id, n) => {
                    engine
                        .update_one(&ns(), &doc! { "_id" => id }, &doc! { "$set" => doc! { "n" => n } }, false)
                        .unwrap();
                }
                Edit::Delete(id) => {
                    engine.delete_one(&ns(), &doc! { "_id" => id }).unwrap();
                }
                Edit::Pass => {
                    engine.do_sync_pass().unwrap();
                }
            }
            engine.verify_undo_collection_empty(&ns()).unwrap();
        }
        for _ in 0..3 {
            engine.do_sync_pass().unwrap();
        }

        let local = by_id(engine.find(&ns(), &Document::new()).unwrap());
        let pushed = by_id(remote.documents(&ns()).iter().map(sanitize_document).collect());
        prop_assert_eq!(&local, &pushed);
        for id in 0..4 {
            let present = local.iter().any(|d| d.get(ID_FIELD) == Some(&Value::from(id)));
            let expected = if present { DocumentState::Synced } else { DocumentState::NotTracked };
            prop_assert_eq!(engine.document_state(&ns(), &Value::from(id)), expected);
        }
    }
}
