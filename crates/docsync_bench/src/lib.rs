//! Benchmarks for docsync.
//!
//! The benchmarks live in `benches/`; this library holds shared data
//! generators.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
