//! # docsync engine
//!
//! Offline-first synchronization of individual documents between a local
//! store and a remote document service.
//!
//! This crate provides:
//! - [`DataSynchronizer`], which runs sync passes: remote changes are applied
//!   locally first, then pending local writes are pushed with versioned
//!   filters
//! - Conflict resolution through [`docsync_protocol::ConflictHandler`], with
//!   failing documents paused until [`DataSynchronizer::resume_sync`]
//! - An undo journal and startup recovery for interrupted local writes
//! - A background worker with backoff after failed passes
//! - Typed [`SyncCollection`] and [`AsyncSyncCollection`] handles
//! - [`SyncRegistry`], an application-owned map of engines that reacts to
//!   authentication changes
//! - [`RemoteService`], the remote seam, and [`MockRemoteService`], an
//!   in-process implementation for tests
//!
//! ## Key Invariants
//!
//! - A document with a pending local write is never overwritten by a remote
//!   change without going through the conflict handler
//! - Remote writes carry the version the local write was based on; a stale
//!   version is a conflict, never a silent overwrite
//! - After recovery the undo journal is empty
//! - Application callbacks run without the engine lock and cannot unwind
//!   into the engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod collection;
mod config;
mod delegate;
mod doc_config;
mod error;
mod instance_config;
mod mock;
mod ns_config;
mod pipeline;
mod registry;
mod remote;
mod stats;
mod synchronizer;
mod undo;
mod worker;

pub use action::{Decision, SyncAction, SyncMessage};
pub use collection::{AsyncSyncCollection, SyncCollection, TypedConflictHandler};
pub use config::{RetryConfig, SyncConfig};
pub use delegate::{ChangeEventListener, ErrorListener};
pub use doc_config::{coalesce_change_events, DocumentState, DocumentSynchronization, DOCUMENT_SCHEMA_VERSION};
pub use error::{SyncError, SyncResult, MONGODB_ERROR_CODE};
pub use instance_config::{
    local_config_database, local_undo_database, local_user_database, ConfigStore, InstanceSynchronization,
};
pub use mock::{InjectedFailure, MockRemoteService};
pub use ns_config::{NamespaceSynchronization, NAMESPACE_SCHEMA_VERSION};
pub use pipeline::run_pipeline;
pub use registry::{instance_key, AppRegistration, RebindEvent, RebindSubscription, StoreFactory, SyncRegistry};
pub use remote::{
    RemoteCollection, RemoteDeleteResult, RemoteInsertManyResult, RemoteInsertOneResult, RemoteService,
    RemoteUpdateResult, WatchResponse,
};
pub use stats::SyncStats;
pub use synchronizer::{
    recover_local_state, DataSynchronizer, RecoveryReport, SyncDeleteResult, SyncInsertManyResult,
    SyncInsertOneResult, SyncUpdateResult,
};
pub use undo::{UndoEntry, UndoJournal};
