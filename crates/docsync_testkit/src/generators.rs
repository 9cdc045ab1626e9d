//! Property-based test generators using proptest.
//!
//! Documents generated here never contain `NaN`, so equality after a
//! round trip through the engine is meaningful.

use docsync_codec::{Document, ObjectId, Value};
use docsync_protocol::MongoNamespace;
use proptest::prelude::*;

/// Strategy for field names without dots or a leading `$`.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-e][a-z0-9]{0,3}").expect("Invalid regex")
}

/// Strategy for valid namespaces.
pub fn namespace_strategy() -> impl Strategy<Value = MongoNamespace> {
    (
        prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex"),
        prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex"),
    )
        .prop_map(|(db, coll)| MongoNamespace::new(db, coll))
}

/// Strategy for scalar values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        (-1.0e9f64..1.0e9).prop_map(Value::Double),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,12}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Binary),
        any::<i64>().prop_map(Value::DateTime),
    ]
}

/// Strategy for values nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4)
                .prop_map(|m| Value::Document(m.into_iter().collect())),
        ]
    })
}

/// Strategy for documents without `_id`.
pub fn content_strategy() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(field_name_strategy(), value_strategy(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

/// Strategy for `_id` values.
pub fn id_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::Int32),
        prop::string::string_regex("[a-z0-9]{1,8}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        Just(()).prop_map(|()| Value::ObjectId(ObjectId::new())),
    ]
}

/// Strategy for documents with an `_id`.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    (id_strategy(), content_strategy()).prop_map(|(id, mut content)| {
        content.insert("_id", id);
        content
    })
}

/// Strategy for a document and an edited copy sharing its `_id`.
pub fn edit_strategy() -> impl Strategy<Value = (Document, Document)> {
    (id_strategy(), content_strategy(), content_strategy()).prop_map(|(id, mut before, mut after)| {
        before.insert("_id", id.clone());
        after.insert("_id", id);
        (before, after)
    })
}

/// Strategy for sequences of distinct small integer ids.
pub fn id_set_strategy(max: usize) -> impl Strategy<Value = Vec<i32>> {
    prop::collection::btree_set(0..1000i32, 1..=max.max(1)).prop_map(|s| s.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{sanitize_document, UpdateDescription};
    use docsync_storage::apply_update;

    proptest! {
        #[test]
        fn test_field_names_are_plain(name in field_name_strategy()) {
            prop_assert!(!name.contains('.'));
            prop_assert!(!name.starts_with('$'));
        }

        #[test]
        fn test_documents_have_ids(doc in document_strategy()) {
            prop_assert!(doc.contains_key("_id"));
        }

        #[test]
        fn test_diff_applies_to_edit((before, after) in edit_strategy()) {
            let diff = UpdateDescription::diff(&before, &after);
            if diff.is_empty() {
                prop_assert_eq!(&before, &after);
            } else {
                let applied = apply_update(&before, &diff.as_update_document()).unwrap();
                prop_assert_eq!(&applied, &after);
            }
        }

        #[test]
        fn test_sanitize_is_idempotent(doc in document_strategy()) {
            let once = sanitize_document(&doc);
            prop_assert_eq!(sanitize_document(&once), once);
        }
    }
}
