//! # docsync storage
//!
//! The local persistent store used by the sync engine.
//!
//! This crate provides:
//! - [`LocalStore`], a small document-oriented CRUD interface
//! - [`MemoryStore`] for tests and ephemeral engines
//! - [`FileStore`], a durable store backed by an append-only, checksummed
//!   log with an exclusive directory lock
//! - [`matches`] and [`apply_update`], the filter and update-operator
//!   subset shared with the in-process remote used in tests
//!
//! ## Example
//!
//! ```rust
//! use docsync_codec::doc;
//! use docsync_storage::{LocalStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.insert_one("app", "tasks", doc! { "_id" => 1, "done" => false }).unwrap();
//! store
//!     .update_one("app", "tasks", &doc! { "_id" => 1 }, &doc! { "$set" => doc! { "done" => true } }, false)
//!     .unwrap();
//! let task = store.find_one("app", "tasks", &doc! { "done" => true }).unwrap();
//! assert!(task.is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
#[cfg(feature = "file")]
mod file;
mod memory;
mod query;
mod state;
mod store;
mod update;

pub use error::{StorageError, StorageResult};
#[cfg(feature = "file")]
pub use file::FileStore;
pub use memory::MemoryStore;
pub use query::{is_operator_document, matches, values_equal};
pub use store::{DocumentChange, LocalStore, UpdateOutcome};
pub use update::{apply_update, is_operator_update, upsert_seed};
