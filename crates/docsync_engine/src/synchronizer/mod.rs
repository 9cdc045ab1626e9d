//! The data synchronizer.
//!
//! [`DataSynchronizer`] owns the bookkeeping of one engine instance and runs
//! sync passes. A pass first applies remote changes to the local store, then
//! pushes pending local writes to the remote, one document at a time.
//!
//! # Concurrency
//!
//! All bookkeeping sits behind one lock that is held only for local work.
//! Remote calls, conflict handlers and application callbacks run without it.
//! Every application-side change to a document bumps its generation, so a
//! pass that started from an older snapshot never overwrites it.

mod batch;
mod crud;
mod l2r;
mod r2l;
mod recovery;
mod resolve;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use docsync_codec::{doc, Document, Value};
use docsync_protocol::{ChangeEvent, ConflictHandler, MongoNamespace, ID_FIELD};
use docsync_storage::LocalStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use crud::{SyncDeleteResult, SyncInsertManyResult, SyncInsertOneResult, SyncUpdateResult};
pub use recovery::RecoveryReport;

use self::batch::DocumentBatch;
use crate::config::SyncConfig;
use crate::delegate::{dispatch_error, ChangeEventListener, ErrorListener};
use crate::doc_config::{DocumentState, DocumentSynchronization};
use crate::error::{SyncError, SyncResult};
use crate::instance_config::{local_user_database, ConfigStore, InstanceSynchronization};
use crate::ns_config::NamespaceSynchronization;
use crate::remote::{RemoteCollection, RemoteService};
use crate::stats::{PassTally, SyncStats};
use crate::undo::UndoJournal;
use crate::worker::Worker;

/// Everything guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) config_store: ConfigStore,
    pub(crate) instance: InstanceSynchronization,
}

impl EngineState {
    fn open(store: Arc<dyn LocalStore>, instance_key: &str) -> SyncResult<Self> {
        let config_store = ConfigStore::new(store.clone(), instance_key);
        let instance = config_store.load()?;
        Ok(Self {
            store,
            config_store,
            instance,
        })
    }
}

/// Handlers of one configured namespace, snapshotted for a pass.
pub(crate) struct NamespaceContext {
    pub(crate) namespace: MongoNamespace,
    pub(crate) remote: RemoteCollection,
    pub(crate) conflict_handler: Arc<dyn ConflictHandler<Document>>,
}

struct Inner {
    config: RwLock<SyncConfig>,
    remote: Arc<dyn RemoteService>,
    state: Mutex<EngineState>,
    // Serializes passes and reinitialization.
    pass_lock: Mutex<()>,
    logical_time: AtomicI64,
    cancelled: AtomicBool,
    closed: AtomicBool,
    stats: RwLock<SyncStats>,
    error_listener: RwLock<Option<Arc<dyn ErrorListener>>>,
    worker: Mutex<Option<Worker>>,
}

/// Synchronizes documents between a local store and a remote service.
///
/// Cheap to clone; clones share the same engine.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use docsync_codec::{doc, Value};
/// use docsync_engine::{DataSynchronizer, MockRemoteService, SyncConfig};
/// use docsync_protocol::{MongoNamespace, RemoteWins};
/// use docsync_storage::MemoryStore;
///
/// let remote = Arc::new(MockRemoteService::new());
/// let engine = DataSynchronizer::new(
///     SyncConfig::new("app/user").with_worker_enabled(false),
///     Arc::new(MemoryStore::new()),
///     remote.clone(),
/// )
/// .unwrap();
///
/// let ns = MongoNamespace::new("db", "todo");
/// engine.configure(&ns, Arc::new(RemoteWins), None, None).unwrap();
/// engine.insert_one(&ns, doc! { "_id" => 1, "title" => "write docs" }).unwrap();
/// assert!(engine.do_sync_pass().unwrap());
/// assert_eq!(remote.documents(&ns).len(), 1);
/// ```
#[derive(Clone)]
pub struct DataSynchronizer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSynchronizer")
            .field("instance_key", &self.inner.config.read().instance_key)
            .field("logical_time", &self.logical_time())
            .finish()
    }
}

impl DataSynchronizer {
    /// Opens the engine over `store`, recovering from any interrupted writes.
    ///
    /// The background worker starts once a namespace is configured.
    pub fn new(config: SyncConfig, store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteService>) -> SyncResult<Self> {
        let mut state = EngineState::open(store, &config.instance_key)?;
        let recovered = recovery::recover(&mut state)?;
        let logical_time = state.instance.max_last_resolution();
        info!(
            instance_key = %config.instance_key,
            namespaces = state.instance.namespaces().count(),
            logical_time,
            restored = recovered.restored,
            "sync engine opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                remote,
                state: Mutex::new(state),
                pass_lock: Mutex::new(()),
                logical_time: AtomicI64::new(logical_time),
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stats: RwLock::new(SyncStats::default()),
                error_listener: RwLock::new(None),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> SyncConfig {
        self.inner.config.read().clone()
    }

    /// Identity scoping the bookkeeping database.
    pub fn instance_key(&self) -> String {
        self.inner.config.read().instance_key.clone()
    }

    /// Current logical time.
    pub fn logical_time(&self) -> i64 {
        self.inner.logical_time.load(Ordering::SeqCst)
    }

    /// Counters describing past passes.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Registers the handlers for `namespace` and starts the worker.
    ///
    /// `error_listener` replaces the engine-wide error listener when given.
    pub fn configure(
        &self,
        namespace: &MongoNamespace,
        conflict_handler: Arc<dyn ConflictHandler<Document>>,
        change_event_listener: Option<Arc<dyn ChangeEventListener>>,
        error_listener: Option<Arc<dyn ErrorListener>>,
    ) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            let EngineState {
                config_store,
                instance,
                ..
            } = &mut *state;
            let ns_config = ensure_namespace(instance, config_store, namespace)?;
            ns_config.configure(conflict_handler, change_event_listener);
        }
        if let Some(listener) = error_listener {
            *self.inner.error_listener.write() = Some(listener);
        }
        info!(ns = %namespace, "namespace configured");
        self.start()
    }

    /// True once `namespace` has a conflict handler.
    pub fn is_configured(&self, namespace: &MongoNamespace) -> bool {
        self.inner
            .state
            .lock()
            .instance
            .get(namespace)
            .map_or(false, NamespaceSynchronization::is_configured)
    }

    /// Starts the background worker if it is enabled and not running.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) || !self.inner.config.read().worker_enabled {
            return Ok(());
        }
        let mut worker = self.inner.worker.lock();
        if worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let mut failures: u32 = 0;
        *worker = Some(Worker::spawn(move || {
            let engine = DataSynchronizer {
                inner: weak.upgrade()?,
            };
            let consecutive_failures = match engine.do_sync_pass() {
                Ok(true) => {
                    failures = 0;
                    0
                }
                Ok(false) => 1,
                Err(SyncError::Cancelled) => 1,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    debug!(error = %e, failures, "sync pass failed");
                    failures
                }
            };
            let sleep = engine.inner.config.read().sleep_after(consecutive_failures);
            Some(sleep)
        })?);
        info!(instance_key = %self.inner.config.read().instance_key, "sync worker started");
        Ok(())
    }

    /// Stops the background worker, abandoning its current pass at the next
    /// document boundary.
    pub fn stop(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            self.inner.cancelled.store(true, Ordering::SeqCst);
            worker.stop();
            self.inner.cancelled.store(false, Ordering::SeqCst);
            info!("sync worker stopped");
        }
    }

    /// True while the background worker is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .map_or(false, |w| !w.is_finished())
    }

    /// Stops the worker for good; later passes do nothing.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop();
    }

    /// Runs one sync pass.
    ///
    /// Returns `Ok(false)` when the pass did not run because the engine is
    /// closed, being reinitialized, or has no configured namespace.
    ///
    /// # Errors
    ///
    /// Engine-level failures, such as the remote being unreachable, abort
    /// the pass and are also delivered to the error listener. Per-document
    /// failures are only delivered to the error listener.
    pub fn do_sync_pass(&self) -> SyncResult<bool> {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.cancelled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let _pass = self.inner.pass_lock.lock();
        let contexts = self.configured_namespaces();
        if contexts.is_empty() {
            return Ok(false);
        }

        let t = self.inner.logical_time.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(t, namespaces = contexts.len(), "sync pass started");
        let mut tally = PassTally::default();
        let outcome = self
            .sync_remote_to_local(t, &contexts, &mut tally)
            .and_then(|()| self.sync_local_to_remote(t, &contexts, &mut tally));

        if let Err(SyncError::Cancelled) = outcome {
            debug!(t, "sync pass cancelled");
            return Err(SyncError::Cancelled);
        }
        let failure = outcome.as_ref().err().map(ToString::to_string);
        self.inner.stats.write().record_pass(tally, failure);
        match outcome {
            Ok(()) => {
                debug!(
                    t,
                    applied = tally.remote_changes_applied,
                    pushed = tally.local_writes_pushed,
                    conflicts = tally.conflicts_encountered,
                    "sync pass finished"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(t, error = %e, "sync pass failed");
                if let Some(listener) = self.inner.error_listener.read().clone() {
                    dispatch_error(listener.as_ref(), &e, None);
                }
                Err(e)
            }
        }
    }

    /// Starts synchronizing `ids` in `namespace`.
    ///
    /// New documents are fetched from the remote on the next pass.
    pub fn sync(&self, namespace: &MongoNamespace, ids: &[Value]) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        let EngineState {
            config_store,
            instance,
            ..
        } = &mut *state;
        let ns_config = ensure_namespace(instance, config_store, namespace)?;
        let mut added = 0usize;
        for id in ids {
            let (config, created) = ns_config.sync_document(id);
            if created {
                if let Err(e) = config_store.save_document(config) {
                    ns_config.remove(id);
                    return Err(e);
                }
                added += 1;
            }
        }
        info!(ns = %namespace, added, total = ns_config.len(), "synchronizing documents");
        Ok(())
    }

    /// Stops synchronizing `ids`, deleting their local copies.
    pub fn desync(&self, namespace: &MongoNamespace, ids: &[Value]) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        let EngineState {
            store,
            config_store,
            instance,
        } = &mut *state;
        let Some(ns_config) = instance.get_mut(namespace) else {
            return Ok(());
        };
        let journal = UndoJournal::new(store.clone(), namespace.clone());
        let user_database = local_user_database(namespace);
        for id in ids {
            if ns_config.get(id).is_none() {
                continue;
            }
            let prior = store.find_by_id(&user_database, &namespace.collection, id)?;
            if let Some(prior) = &prior {
                journal.begin_undo(id, Some(prior))?;
                if let Err(e) = store.delete_one(&user_database, &namespace.collection, &doc! { ID_FIELD => id.clone() }) {
                    journal.commit_undo(id)?;
                    return Err(e.into());
                }
            }
            if let Err(e) = forget_document(ns_config, config_store, id) {
                if let Some(prior) = &prior {
                    journal.roll_back(id, Some(prior));
                }
                return Err(e);
            }
            if prior.is_some() {
                journal.commit_undo(id)?;
            }
            debug!(ns = %namespace, document_id = %id, "document desynced");
        }
        Ok(())
    }

    /// `_id`s synchronized in `namespace`.
    pub fn synced_ids(&self, namespace: &MongoNamespace) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .instance
            .get(namespace)
            .map(NamespaceSynchronization::synced_ids)
            .unwrap_or_default()
    }

    /// `_id`s paused in `namespace`.
    pub fn paused_ids(&self, namespace: &MongoNamespace) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .instance
            .get(namespace)
            .map(NamespaceSynchronization::paused_ids)
            .unwrap_or_default()
    }

    /// Namespaces with bookkeeping, configured or not.
    pub fn namespaces(&self) -> Vec<MongoNamespace> {
        self.inner
            .state
            .lock()
            .instance
            .namespaces()
            .map(|ns| ns.namespace().clone())
            .collect()
    }

    /// Lifecycle state of one document.
    pub fn document_state(&self, namespace: &MongoNamespace, document_id: &Value) -> DocumentState {
        self.document_config(namespace, document_id)
            .map_or(DocumentState::NotTracked, |c| c.state())
    }

    /// Snapshot of one document's bookkeeping.
    pub fn document_config(&self, namespace: &MongoNamespace, document_id: &Value) -> Option<DocumentSynchronization> {
        self.inner
            .state
            .lock()
            .instance
            .get(namespace)
            .and_then(|ns| ns.get(document_id))
            .cloned()
    }

    /// Resumes a paused document; it is re-fetched on the next pass.
    ///
    /// Returns false when the document is not paused.
    pub fn resume_sync(&self, namespace: &MongoNamespace, document_id: &Value) -> SyncResult<bool> {
        let mut state = self.inner.state.lock();
        let EngineState {
            config_store,
            instance,
            ..
        } = &mut *state;
        let Some(config) = instance.get_mut(namespace).and_then(|ns| ns.get_mut(document_id)) else {
            return Ok(false);
        };
        if !config.is_paused() {
            return Ok(false);
        }
        config.set_paused(false);
        config.set_stale(true);
        config.touch();
        config_store.save_document(config)?;
        info!(ns = %namespace, document_id = %document_id, "document resumed");
        Ok(true)
    }

    /// Fails when the undo journal of `namespace` holds entries.
    pub fn verify_undo_collection_empty(&self, namespace: &MongoNamespace) -> SyncResult<()> {
        let store = self.inner.state.lock().store.clone();
        UndoJournal::new(store, namespace.clone()).verify_empty()
    }

    /// Switches to another instance key and store, e.g. after the active
    /// user changed.
    ///
    /// Waits for any running pass, swaps the bookkeeping, recovers, and
    /// restarts the worker if it was running. Registered handlers are kept
    /// for namespaces of the same name.
    pub fn reinitialize(&self, instance_key: impl Into<String>, store: Arc<dyn LocalStore>) -> SyncResult<()> {
        let instance_key = instance_key.into();
        let was_running = self.is_running();
        self.stop();
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let swapped = self.swap_state(&instance_key, store);
        self.inner.cancelled.store(false, Ordering::SeqCst);
        swapped?;
        info!(instance_key = %instance_key, "sync engine reinitialized");
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    fn swap_state(&self, instance_key: &str, store: Arc<dyn LocalStore>) -> SyncResult<()> {
        let _pass = self.inner.pass_lock.lock();
        let mut state = self.inner.state.lock();
        let mut fresh = EngineState::open(store, instance_key)?;
        for ns_config in state.instance.namespaces() {
            let Some(handler) = ns_config.conflict_handler() else {
                continue;
            };
            let (target, created) = fresh.instance.get_or_create(ns_config.namespace());
            target.configure(handler, ns_config.change_event_listener());
            if created {
                fresh.config_store.save_namespace(target)?;
            }
        }
        recovery::recover(&mut fresh)?;
        self.inner
            .logical_time
            .store(fresh.instance.max_last_resolution(), Ordering::SeqCst);
        *state = fresh;
        self.inner.config.write().instance_key = instance_key.to_string();
        Ok(())
    }

    pub(crate) fn check_cancelled(&self) -> SyncResult<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) || self.inner.closed.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn remote_collection(&self, namespace: &MongoNamespace) -> RemoteCollection {
        let timeout = self.inner.config.read().remote_timeout;
        RemoteCollection::new(self.inner.remote.clone(), namespace.clone()).with_timeout(timeout)
    }

    fn configured_namespaces(&self) -> Vec<NamespaceContext> {
        let state = self.inner.state.lock();
        state
            .instance
            .namespaces()
            .filter_map(|ns| {
                let conflict_handler = ns.conflict_handler()?;
                Some(NamespaceContext {
                    namespace: ns.namespace().clone(),
                    remote: self.remote_collection(ns.namespace()),
                    conflict_handler,
                })
            })
            .collect()
    }

    /// Working copy of a document's bookkeeping for a batch.
    fn begin_batch(&self, namespace: &MongoNamespace, document_id: &Value) -> Option<DocumentBatch> {
        self.inner
            .state
            .lock()
            .instance
            .get(namespace)
            .and_then(|ns| ns.get(document_id))
            .cloned()
            .map(DocumentBatch::new)
    }

    /// Like [`Self::begin_batch`], and marks the live record as being
    /// pushed until the batch commits or [`Self::end_push`] runs.
    fn begin_push_batch(&self, namespace: &MongoNamespace, document_id: &Value) -> Option<DocumentBatch> {
        let mut state = self.inner.state.lock();
        let live = state.instance.get_mut(namespace)?.get_mut(document_id)?;
        live.set_push_in_flight(true);
        Some(DocumentBatch::new(live.clone()))
    }

    fn end_push(&self, namespace: &MongoNamespace, document_id: &Value) {
        let mut state = self.inner.state.lock();
        if let Some(live) = state
            .instance
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(document_id))
        {
            live.set_push_in_flight(false);
        }
    }

    fn commit_batch(&self, ctx: &NamespaceContext, batch: DocumentBatch) -> SyncResult<()> {
        let outbox = {
            let mut state = self.inner.state.lock();
            batch.commit(&mut state)?
        };
        let error_listener = self.inner.error_listener.read().clone();
        outbox.flush(Some(&ctx.remote), error_listener.as_deref());
        Ok(())
    }
}

/// Rolls back interrupted local writes in `store` without starting an
/// engine.
pub fn recover_local_state(store: Arc<dyn LocalStore>, instance_key: &str) -> SyncResult<RecoveryReport> {
    let mut state = EngineState::open(store, instance_key)?;
    recovery::recover(&mut state)
}

/// The namespace's bookkeeping, created and persisted if needed.
fn ensure_namespace<'a>(
    instance: &'a mut InstanceSynchronization,
    config_store: &ConfigStore,
    namespace: &MongoNamespace,
) -> SyncResult<&'a mut NamespaceSynchronization> {
    let (ns_config, created) = instance.get_or_create(namespace);
    if created {
        config_store.save_namespace(ns_config)?;
    }
    Ok(ns_config)
}

/// Persists the live record of `document_id`, if it is still tracked.
fn save_tracked(
    ns_config: &NamespaceSynchronization,
    config_store: &ConfigStore,
    document_id: &Value,
) -> SyncResult<()> {
    match ns_config.get(document_id) {
        Some(config) => config_store.save_document(config),
        None => Ok(()),
    }
}

/// Stops synchronizing `document_id`. The in-memory record is dropped only
/// after its persisted copy is gone.
fn forget_document(
    ns_config: &mut NamespaceSynchronization,
    config_store: &ConfigStore,
    document_id: &Value,
) -> SyncResult<()> {
    config_store.delete_document(ns_config.namespace(), document_id)?;
    ns_config.remove(document_id);
    Ok(())
}

/// Records a local write in the bookkeeping of `document_id` and persists it.
///
/// Returns the record as it was before, for rolling back later writes of the
/// same operation. On failure that record is already back in place.
fn record_local_write(
    ns_config: &mut NamespaceSynchronization,
    config_store: &ConfigStore,
    document_id: &Value,
    at_time: i64,
    change_event: ChangeEvent,
    fresh_insert: bool,
) -> SyncResult<Option<DocumentSynchronization>> {
    let previous = ns_config.get(document_id).cloned();
    let (config, created) = ns_config.sync_document(document_id);
    if created && fresh_insert {
        config.set_stale(false);
    }
    match config.set_some_pending_writes_and_save(config_store, at_time, change_event) {
        Ok(()) => Ok(previous),
        Err(e) => {
            restore_tracked(ns_config, config_store, document_id, previous);
            Err(e)
        }
    }
}

/// Puts back the record of `document_id` as it was before a failed write.
fn restore_tracked(
    ns_config: &mut NamespaceSynchronization,
    config_store: &ConfigStore,
    document_id: &Value,
    previous: Option<DocumentSynchronization>,
) {
    let persisted = match previous {
        Some(mut previous) => {
            previous.touch();
            let saved = config_store.save_document(&previous);
            ns_config.insert(previous);
            saved
        }
        None => {
            ns_config.remove(document_id);
            config_store.delete_document(ns_config.namespace(), document_id)
        }
    };
    if let Err(e) = persisted {
        warn!(
            ns = %ns_config.namespace(),
            document_id = %document_id,
            error = %e,
            "failed to restore document bookkeeping"
        );
    }
}
