//! The file store must behave like the memory store, and keep doing so
//! after a reopen.

use docsync_codec::{doc, Document, Value};
use docsync_storage::{FileStore, LocalStore, MemoryStore};
use proptest::prelude::*;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Insert(i32, i32),
    Set(i32, i32),
    Unset(i32),
    Delete(i32),
    DeleteAbove(i32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..8i32, any::<i32>()).prop_map(|(id, n)| Op::Insert(id, n)),
        (0..8i32, any::<i32>()).prop_map(|(id, n)| Op::Set(id, n)),
        (0..8i32).prop_map(Op::Unset),
        (0..8i32).prop_map(Op::Delete),
        (0..8i32).prop_map(Op::DeleteAbove),
    ]
}

fn run(store: &dyn LocalStore, op: &Op) {
    match op {
        Op::Insert(id, n) => {
            let _ = store.insert_one("db", "c", doc! { "_id" => *id, "n" => *n });
        }
        Op::Set(id, n) => {
            store
                .update_one("db", "c", &doc! { "_id" => *id }, &doc! { "$set" => doc! { "n" => *n } }, false)
                .unwrap();
        }
        Op::Unset(id) => {
            store
                .update_one("db", "c", &doc! { "_id" => *id }, &doc! { "$unset" => doc! { "n" => true } }, false)
                .unwrap();
        }
        Op::Delete(id) => {
            store.delete_one("db", "c", &doc! { "_id" => *id }).unwrap();
        }
        Op::DeleteAbove(id) => {
            store
                .delete_many("db", "c", &doc! { "_id" => doc! { "$gt" => *id } })
                .unwrap();
        }
    }
}

fn contents(store: &dyn LocalStore) -> Vec<Document> {
    let mut all = store.find("db", "c", &Document::new()).unwrap();
    all.sort_by(|a, b| {
        a.get("_id")
            .unwrap_or(&Value::Null)
            .compare(b.get("_id").unwrap_or(&Value::Null))
    });
    all
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn file_store_matches_memory_store(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::new();
        let expected = {
            let file = FileStore::open(dir.path()).unwrap().with_sync_writes(false);
            for op in &ops {
                run(&memory, op);
                run(&file, op);
            }
            let expected = contents(&memory);
            prop_assert_eq!(contents(&file), expected.clone());
            expected
        };

        let reopened = FileStore::open(dir.path()).unwrap();
        prop_assert_eq!(contents(&reopened), expected);
    }
}
