//! Benchmark utilities.

use docsync_codec::{Document, Value};
use rand::Rng;

/// Generate a random string of the given length.
pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Generate a document `{_id: id, f0: .., f1: .., ...}` with `fields`
/// mixed-type fields and one embedded document.
pub fn random_document(id: i64, fields: usize) -> Document {
    let mut rng = rand::thread_rng();
    let mut document = Document::with_capacity(fields + 2);
    document.insert("_id", id);
    for i in 0..fields {
        let value = match i % 4 {
            0 => Value::Int64(rng.gen()),
            1 => Value::String(random_text(16)),
            2 => Value::Bool(rng.gen()),
            _ => Value::Double(rng.gen_range(-1.0e6..1.0e6)),
        };
        document.insert(format!("f{i}"), value);
    }
    let mut nested = Document::new();
    nested.insert("city", random_text(8));
    nested.insert("zip", rng.gen_range(10_000i64..99_999));
    document.insert("address", nested);
    document
}

/// Generate `count` documents with `_id`s `0..count`.
pub fn generate_documents(count: usize, fields: usize) -> Vec<Document> {
    (0..count)
        .map(|i| random_document(i64::try_from(i).unwrap_or(i64::MAX), fields))
        .collect()
}

/// A copy of `document` with roughly one field in `every` changed.
pub fn edited(document: &Document, every: usize) -> Document {
    let mut copy = document.clone();
    let keys: Vec<String> = copy
        .keys()
        .filter(|k| k.as_str() != "_id")
        .step_by(every.max(1))
        .cloned()
        .collect();
    for key in keys {
        copy.insert(key, random_text(12));
    }
    copy
}
