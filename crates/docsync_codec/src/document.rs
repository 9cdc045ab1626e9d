//! Ordered key/value documents.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// An ordered map from field names to values.
///
/// Field order is preserved for iteration and display, but equality and
/// hashing ignore it: two documents are equal when they hold the same set
/// of fields with equal values.
#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty document with room for `capacity` fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Returns the value for a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    /// Mutable access to a top-level value.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self.position(key) {
            Some(i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// True when the top-level key is present (even if its value is null).
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Inserts or replaces a field, returning the previous value.
    ///
    /// Replacing keeps the field's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Removes a top-level field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    /// Iterates fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Iterates field names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Returns the string value of a field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Returns an integer field, accepting either width.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Returns an embedded document field.
    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    /// Returns an array field.
    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> CodecResult<&str> {
        let value = self.get(key).ok_or_else(|| CodecError::missing_field(key))?;
        value
            .as_str()
            .ok_or_else(|| CodecError::type_mismatch(key, "string", value.type_name()))
    }

    /// Required integer field.
    pub fn require_i64(&self, key: &str) -> CodecResult<i64> {
        let value = self.get(key).ok_or_else(|| CodecError::missing_field(key))?;
        value
            .as_i64()
            .ok_or_else(|| CodecError::type_mismatch(key, "integer", value.type_name()))
    }

    /// Required boolean field.
    pub fn require_bool(&self, key: &str) -> CodecResult<bool> {
        let value = self.get(key).ok_or_else(|| CodecError::missing_field(key))?;
        value
            .as_bool()
            .ok_or_else(|| CodecError::type_mismatch(key, "bool", value.type_name()))
    }

    /// Required embedded document field.
    pub fn require_document(&self, key: &str) -> CodecResult<&Document> {
        let value = self.get(key).ok_or_else(|| CodecError::missing_field(key))?;
        value
            .as_document()
            .ok_or_else(|| CodecError::type_mismatch(key, "document", value.type_name()))
    }

    /// Looks up a dotted path such as `"a.b.c"`.
    ///
    /// Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = match current {
                Value::Document(d) => d.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Sets a dotted path, creating intermediate documents as needed.
    ///
    /// Fails when an intermediate segment holds a non-document value.
    pub fn set_path(&mut self, path: &str, value: Value) -> CodecResult<()> {
        match path.split_once('.') {
            None => {
                self.insert(path, value);
                Ok(())
            }
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    self.insert(head, Document::new());
                }
                match self.get_mut(head) {
                    Some(Value::Document(child)) => child.set_path(rest, value),
                    Some(other) => Err(CodecError::type_mismatch(
                        head,
                        "document",
                        other.type_name(),
                    )),
                    None => Err(CodecError::missing_field(head)),
                }
            }
        }
    }

    /// Removes a dotted path, returning the removed value.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head) {
                Some(Value::Document(child)) => child.remove_path(rest),
                _ => None,
            },
        }
    }

    /// Keeps only the fields for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
    }

    /// Entries sorted by key, used wherever a field-order independent view
    /// is needed.
    pub(crate) fn sorted_entries(&self) -> Vec<&(String, Value)> {
        let mut sorted: Vec<&(String, Value)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let sorted = self.sorted_entries();
        sorted.len().hash(state);
        for (k, v) in sorted {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k:?}: {v}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, Value)>,
        fn(&'a (String, Value)) -> (&'a String, &'a Value),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .iter()
            .map(entry_ref as fn(&'a (String, Value)) -> (&'a String, &'a Value))
    }
}

fn entry_ref(entry: &(String, Value)) -> (&String, &Value) {
    (&entry.0, &entry.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn insert_replaces_in_place() {
        let mut d = doc! { "a" => 1, "b" => 2 };
        assert_eq!(d.insert("a", 3), Some(Value::Int32(1)));
        assert_eq!(d.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(d.get("a"), Some(&Value::Int32(3)));
    }

    #[test]
    fn equality_ignores_field_order() {
        let a = doc! { "x" => 1, "y" => "two" };
        let b = doc! { "y" => "two", "x" => 1 };
        assert_eq!(a, b);
        assert_ne!(a, doc! { "x" => 1 });
    }

    #[test]
    fn null_field_is_present() {
        let d = doc! { "gone" => Value::Null };
        assert!(d.contains_key("gone"));
        assert_eq!(d.get("gone"), Some(&Value::Null));
    }

    #[test]
    fn dotted_paths() {
        let mut d = doc! { "a" => doc! { "b" => 1 }, "list" => vec![10, 20] };
        assert_eq!(d.get_path("a.b"), Some(&Value::Int32(1)));
        assert_eq!(d.get_path("list.1"), Some(&Value::Int32(20)));
        assert_eq!(d.get_path("a.missing"), None);

        d.set_path("a.c.d", Value::from("deep")).unwrap();
        assert_eq!(d.get_path("a.c.d"), Some(&Value::from("deep")));

        assert_eq!(d.remove_path("a.b"), Some(Value::Int32(1)));
        assert_eq!(d.get_path("a.b"), None);
    }

    #[test]
    fn set_path_through_scalar_fails() {
        let mut d = doc! { "a" => 1 };
        assert!(d.set_path("a.b", Value::Null).is_err());
    }

    #[test]
    fn require_reports_type() {
        let d = doc! { "n" => "text" };
        let err = d.require_i64("n").unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { expected: "integer", .. }));
        assert!(matches!(d.require_str("m"), Err(CodecError::MissingField { .. })));
    }
}
