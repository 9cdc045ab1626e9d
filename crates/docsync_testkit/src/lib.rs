//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Engine fixtures wired to an in-process mock remote
//! - Property-based test generators using proptest
//! - Helpers that stage conflicting local and remote writes
//! - Crash simulation for local-write recovery
//! - A local store that fails writes on demand
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     let t = scenarios::synced_engine(1);
//!     stage_conflict(&t, 0, doc! { "n" => 1 }, doc! { "_id" => 0, "n" => 2 });
//!     t.pass();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod conflicts;
pub mod crash;
pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::conflicts::*;
    pub use crate::crash::*;
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use conflicts::*;
pub use crash::*;
pub use faults::*;
pub use fixtures::*;
pub use generators::*;
