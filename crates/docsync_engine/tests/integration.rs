//! Integration tests for several engines sharing one remote.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use docsync_codec::{doc, Document, Value};
use docsync_engine::{
    DataSynchronizer, DocumentState, ErrorListener, MockRemoteService, RemoteService, RetryConfig, SyncConfig,
    SyncError, SyncResult,
};
use docsync_protocol::{ChangeEvent, ConflictHandler, MongoNamespace, ProtocolError, ProtocolResult, RemoteWins};
use docsync_storage::MemoryStore;

fn ns() -> MongoNamespace {
    MongoNamespace::new("db", "todo")
}

/// An engine for one device, passes driven by the test.
fn device(instance_key: &str, remote: &Arc<MockRemoteService>) -> DataSynchronizer {
    let engine = DataSynchronizer::new(
        SyncConfig::new(instance_key).with_worker_enabled(false),
        Arc::new(MemoryStore::new()),
        remote.clone(),
    )
    .unwrap();
    engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();
    engine
}

fn local(engine: &DataSynchronizer, id: i32) -> Option<Document> {
    engine.find_one(&ns(), &doc! { "_id" => id }).unwrap()
}

fn set(engine: &DataSynchronizer, id: i32, update: Document) {
    let result = engine
        .update_one(&ns(), &doc! { "_id" => id }, &doc! { "$set" => update }, false)
        .unwrap();
    assert_eq!(result.modified_count, 1);
}

#[test]
fn edits_flow_between_devices() {
    let remote = Arc::new(MockRemoteService::new());
    let phone = device("app/phone", &remote);
    let laptop = device("app/laptop", &remote);

    phone.insert_one(&ns(), doc! { "_id" => 1, "title" => "milk" }).unwrap();
    assert!(phone.do_sync_pass().unwrap());

    laptop.sync(&ns(), &[Value::from(1)]).unwrap();
    assert!(laptop.do_sync_pass().unwrap());
    assert_eq!(local(&laptop, 1), Some(doc! { "_id" => 1, "title" => "milk" }));

    set(&laptop, 1, doc! { "title" => "oat milk" });
    assert!(laptop.do_sync_pass().unwrap());
    assert_eq!(laptop.document_state(&ns(), &Value::from(1)), DocumentState::Synced);

    assert!(phone.do_sync_pass().unwrap());
    assert_eq!(local(&phone, 1), Some(doc! { "_id" => 1, "title" => "oat milk" }));
    assert_eq!(phone.stats().conflicts_encountered, 0);
}

#[test]
fn stale_local_write_loses_to_newer_remote_version() {
    let remote = Arc::new(MockRemoteService::new());
    let phone = device("app/phone", &remote);
    let laptop = device("app/laptop", &remote);

    phone.insert_one(&ns(), doc! { "_id" => 1, "n" => 0 }).unwrap();
    phone.do_sync_pass().unwrap();
    laptop.sync(&ns(), &[Value::from(1)]).unwrap();
    laptop.do_sync_pass().unwrap();

    set(&phone, 1, doc! { "n" => 1 });
    phone.do_sync_pass().unwrap();
    set(&laptop, 1, doc! { "n" => 2 });
    laptop.do_sync_pass().unwrap();

    assert_eq!(laptop.stats().conflicts_encountered, 1);
    assert_eq!(local(&laptop, 1), Some(doc! { "_id" => 1, "n" => 1 }));
    assert_eq!(laptop.document_state(&ns(), &Value::from(1)), DocumentState::Synced);
    laptop.verify_undo_collection_empty(&ns()).unwrap();
    phone.verify_undo_collection_empty(&ns()).unwrap();
}

#[test]
fn background_worker_pushes_writes() {
    let remote = Arc::new(MockRemoteService::new());
    let engine = DataSynchronizer::new(
        SyncConfig::new("app/worker")
            .with_short_sleep(Duration::from_millis(10))
            .with_long_sleep(Duration::from_millis(10))
            .with_retry(RetryConfig::no_backoff()),
        Arc::new(MemoryStore::new()),
        remote.clone(),
    )
    .unwrap();
    engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();
    assert!(engine.is_running());

    engine.insert_one(&ns(), doc! { "_id" => 1 }).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while remote.documents(&ns()).is_empty() {
        assert!(Instant::now() < deadline, "worker never pushed the insert");
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.close();
    assert!(!engine.is_running());
    assert!(!engine.do_sync_pass().unwrap());
}

/// Forwards to a mock remote. Right after the first insert reaches the
/// remote, deletes document 1 locally on `engine`.
struct DeleteDuringInsert {
    remote: Arc<MockRemoteService>,
    engine: OnceLock<DataSynchronizer>,
    fired: AtomicBool,
}

impl RemoteService for DeleteDuringInsert {
    fn call_function(&self, name: &str, args: &[Document], timeout: Option<Duration>) -> SyncResult<Value> {
        let result = self.remote.call_function(name, args, timeout);
        if name == "insertOne" && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(engine) = self.engine.get() {
                let deleted = engine.delete_one(&ns(), &doc! { "_id" => 1 }).unwrap();
                assert_eq!(deleted.deleted_count, 1);
            }
        }
        result
    }
}

#[test]
fn delete_during_insert_push_reaches_remote() {
    let remote = Arc::new(MockRemoteService::new());
    let service = Arc::new(DeleteDuringInsert {
        remote: remote.clone(),
        engine: OnceLock::new(),
        fired: AtomicBool::new(false),
    });
    let engine = DataSynchronizer::new(
        SyncConfig::new("app/phone").with_worker_enabled(false),
        Arc::new(MemoryStore::new()),
        service.clone(),
    )
    .unwrap();
    engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();
    assert!(service.engine.set(engine.clone()).is_ok());

    engine.insert_one(&ns(), doc! { "_id" => 1, "title" => "milk" }).unwrap();
    assert!(engine.do_sync_pass().unwrap());
    // The insert landed remotely; the delete is still owed.
    assert_eq!(remote.documents(&ns()).len(), 1);
    assert_eq!(local(&engine, 1), None);
    assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::PendingLocalWrite);

    assert!(engine.do_sync_pass().unwrap());
    assert!(engine.do_sync_pass().unwrap());
    assert!(remote.documents(&ns()).is_empty());
    assert_eq!(local(&engine, 1), None);
    assert_eq!(engine.document_state(&ns(), &Value::from(1)), DocumentState::NotTracked);
    engine.verify_undo_collection_empty(&ns()).unwrap();
    engine.close();
}

/// Fails every conflict on one `_id`; lets the remote win elsewhere.
struct FailsFor(Value);

impl ConflictHandler<Document> for FailsFor {
    fn resolve_conflict(
        &self,
        document_id: &Value,
        _local_event: &ChangeEvent<Document>,
        remote_event: &ChangeEvent<Document>,
    ) -> ProtocolResult<Option<Document>> {
        if document_id == &self.0 {
            Err(ProtocolError::resolution("cannot merge"))
        } else {
            Ok(remote_event.full_document.clone())
        }
    }
}

#[test]
fn failing_document_does_not_hold_back_the_others() {
    let remote = Arc::new(MockRemoteService::new());
    let phone = device("app/phone", &remote);
    for id in 1..=3 {
        phone.insert_one(&ns(), doc! { "_id" => id, "n" => 0 }).unwrap();
    }
    phone.do_sync_pass().unwrap();

    let reported: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::default();
    let sink = reported.clone();
    let listener: Arc<dyn ErrorListener> = Arc::new(move |error: &SyncError, id: Option<&Value>| {
        sink.lock().unwrap().push((error.to_string(), id.cloned()));
    });
    let laptop = DataSynchronizer::new(
        SyncConfig::new("app/laptop").with_worker_enabled(false),
        Arc::new(MemoryStore::new()),
        remote.clone(),
    )
    .unwrap();
    laptop
        .configure(&ns(), Arc::new(FailsFor(Value::from(2))), None, Some(listener))
        .unwrap();
    laptop.sync(&ns(), &[1, 2, 3].map(Value::from)).unwrap();
    laptop.do_sync_pass().unwrap();

    for id in 1..=3 {
        set(&laptop, id, doc! { "n" => 1 });
        set(&phone, id, doc! { "n" => 2 });
    }
    phone.do_sync_pass().unwrap();
    laptop.do_sync_pass().unwrap();

    assert_eq!(laptop.document_state(&ns(), &Value::from(2)), DocumentState::Paused);
    assert_eq!(local(&laptop, 2), Some(doc! { "_id" => 2, "n" => 1 }));
    for id in [1, 3] {
        assert_eq!(local(&laptop, id), Some(doc! { "_id" => id, "n" => 2 }));
        assert_eq!(laptop.document_state(&ns(), &Value::from(id)), DocumentState::Synced);
    }
    let reported = reported.lock().unwrap();
    assert!(!reported.is_empty());
    assert!(
        reported.iter().all(|(_, id)| id.as_ref() == Some(&Value::from(2))),
        "{reported:?}"
    );
    laptop.verify_undo_collection_empty(&ns()).unwrap();
}

/// Forwards to a mock remote, slowly.
struct SlowRemote {
    remote: Arc<MockRemoteService>,
    calls: AtomicUsize,
}

impl RemoteService for SlowRemote {
    fn call_function(&self, name: &str, args: &[Document], timeout: Option<Duration>) -> SyncResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        self.remote.call_function(name, args, timeout)
    }
}

#[test]
fn stop_from_two_threads_during_a_pass() {
    let remote = Arc::new(MockRemoteService::new());
    let service = Arc::new(SlowRemote {
        remote: remote.clone(),
        calls: AtomicUsize::new(0),
    });
    let engine = DataSynchronizer::new(
        SyncConfig::new("app/worker")
            .with_short_sleep(Duration::from_millis(1))
            .with_long_sleep(Duration::from_millis(1))
            .with_retry(RetryConfig::no_backoff()),
        Arc::new(MemoryStore::new()),
        service.clone(),
    )
    .unwrap();
    for id in 0..20 {
        engine.insert_one(&ns(), doc! { "_id" => id }).unwrap();
    }
    engine.configure(&ns(), Arc::new(RemoteWins), None, None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while service.calls.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "worker never started a pass");
        thread::sleep(Duration::from_millis(1));
    }
    let other = engine.clone();
    let stopper = thread::spawn(move || other.stop());
    engine.stop();
    stopper.join().unwrap();
    engine.stop();
    assert!(!engine.is_running());

    // Manual passes still run once the worker is gone.
    assert!(engine.do_sync_pass().unwrap());
    assert_eq!(remote.documents(&ns()).len(), 20);
    engine.verify_undo_collection_empty(&ns()).unwrap();
}
