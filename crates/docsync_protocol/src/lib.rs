//! # docsync protocol
//!
//! The vocabulary shared by the local store, the remote service and the
//! sync engine.
//!
//! This crate provides:
//! - [`ChangeEvent`] and [`CompactChangeEvent`], full and storage-oriented
//!   descriptions of one document mutation
//! - [`UpdateDescription`] and the recursive document differ
//! - [`Version`] and [`DocumentVersionInfo`], the per-document version
//!   tokens used to detect independent remote changes
//! - [`DocumentCodec`] for typed application documents
//! - [`ConflictHandler`] with the [`RemoteWins`] and [`LocalWins`] policies
//!
//! ## Example
//!
//! ```
//! use docsync_codec::doc;
//! use docsync_protocol::UpdateDescription;
//!
//! let ours = doc! { "a" => doc! { "b" => 1, "c" => 2 } };
//! let theirs = doc! { "a" => doc! { "b" => 1, "c" => 3 } };
//! let diff = UpdateDescription::diff(&ours, &theirs);
//! assert_eq!(diff.updated_fields, doc! { "a.c" => 3 });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_event;
mod codec;
mod compact;
mod conflict;
mod error;
mod namespace;
mod operation;
mod update_description;
mod version;

pub use change_event::ChangeEvent;
pub use codec::DocumentCodec;
pub use compact::CompactChangeEvent;
pub use conflict::{ConflictHandler, LocalWins, RemoteWins};
pub use error::{ProtocolError, ProtocolResult};
pub use namespace::MongoNamespace;
pub use operation::OperationType;
pub use update_description::UpdateDescription;
pub use version::{
    sanitize_document, version_document_of, version_update_document, with_version,
    DocumentVersionInfo, Version, DOCUMENT_VERSION_FIELD, ID_FIELD, SYNC_PROTOCOL_VERSION,
};

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::{Document, Value};
    use proptest::prelude::*;

    fn arb_document() -> impl Strategy<Value = Document> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int32),
            any::<f64>().prop_map(Value::Double),
            "[a-z]{0,6}".prop_map(Value::String),
        ];
        let value = leaf.prop_recursive(2, 16, 3, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                proptest::collection::btree_map("[a-d]{1,2}", inner, 0..3)
                    .prop_map(|m| Value::Document(m.into_iter().collect())),
            ]
        });
        proptest::collection::btree_map("[a-d]{1,2}", value, 0..5)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn diff_with_self_is_empty(d in arb_document()) {
            prop_assert!(UpdateDescription::diff(&d, &d).is_empty());
        }

        #[test]
        fn diff_never_touches_reserved_fields(a in arb_document(), b in arb_document()) {
            let mut a = a;
            a.insert(ID_FIELD, 1);
            a.insert(DOCUMENT_VERSION_FIELD, Version::fresh().to_document());
            let diff = UpdateDescription::diff(&a, &b);
            prop_assert!(diff.paths().all(|p| p != ID_FIELD && p != DOCUMENT_VERSION_FIELD));
        }
    }
}
