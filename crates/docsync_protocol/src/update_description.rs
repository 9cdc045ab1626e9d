//! Field-level update descriptions and the document differ.

use docsync_codec::{Document, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::version::{DOCUMENT_VERSION_FIELD, ID_FIELD};

/// The fields changed by an `update` operation.
///
/// `updated_fields` is flat: nested changes are keyed by dotted path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDescription {
    /// New or changed values keyed by (possibly dotted) path.
    pub updated_fields: Document,
    /// Dotted paths that were removed.
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// Creates a description from its parts.
    pub fn new(updated_fields: Document, removed_fields: Vec<String>) -> Self {
        Self {
            updated_fields,
            removed_fields,
        }
    }

    /// Computes the update that turns `ours` into `theirs`.
    ///
    /// `_id` and the version field are ignored at every depth. Embedded
    /// documents present on both sides are diffed recursively; arrays and
    /// scalars are replaced whole.
    pub fn diff(ours: &Document, theirs: &Document) -> Self {
        let mut description = Self::default();
        diff_into(ours, theirs, None, &mut description);
        description
    }

    /// True when nothing was updated or removed.
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }

    /// Renders the description as a `$set`/`$unset` update document.
    pub fn as_update_document(&self) -> Document {
        let mut update = Document::new();
        if !self.updated_fields.is_empty() {
            update.insert("$set", self.updated_fields.clone());
        }
        if !self.removed_fields.is_empty() {
            let unset: Document = self
                .removed_fields
                .iter()
                .map(|path| (path.as_str(), true))
                .collect();
            update.insert("$unset", unset);
        }
        update
    }

    /// Every path touched by this description.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updated_fields
            .keys()
            .map(String::as_str)
            .chain(self.removed_fields.iter().map(String::as_str))
    }

    /// Combines this description with a later one.
    ///
    /// Returns `None` when a path of one is equal to, or a prefix of, a path
    /// of the other. Such updates cannot be flattened into one description
    /// without knowing the document they apply to.
    pub fn merge(&self, later: &UpdateDescription) -> Option<UpdateDescription> {
        for earlier_path in self.paths() {
            if later.paths().any(|p| paths_overlap(earlier_path, p)) {
                return None;
            }
        }

        let mut merged = self.clone();
        for (path, value) in &later.updated_fields {
            merged.updated_fields.insert(path.clone(), value.clone());
        }
        merged
            .removed_fields
            .extend(later.removed_fields.iter().cloned());
        Some(merged)
    }

    /// Encodes as `{updatedFields, removedFields}`.
    pub fn to_document(&self) -> Document {
        let removed: Vec<Value> = self
            .removed_fields
            .iter()
            .map(|p| Value::from(p.as_str()))
            .collect();
        let mut document = Document::with_capacity(2);
        document.insert("updatedFields", self.updated_fields.clone());
        document.insert("removedFields", removed);
        document
    }

    /// Decodes from `{updatedFields, removedFields}`; both keys are optional.
    pub fn from_document(document: &Document) -> ProtocolResult<Self> {
        let updated_fields = match document.get("updatedFields") {
            None | Some(Value::Null) => Document::new(),
            Some(Value::Document(d)) => d.clone(),
            Some(other) => {
                return Err(ProtocolError::decoding(format!(
                    "updatedFields must be a document, found {}",
                    other.type_name()
                )))
            }
        };
        let removed_fields = match document.get("removedFields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ProtocolError::decoding("removedFields entries must be strings")
                    })
                })
                .collect::<ProtocolResult<Vec<_>>>()?,
            Some(other) => {
                return Err(ProtocolError::decoding(format!(
                    "removedFields must be an array, found {}",
                    other.type_name()
                )))
            }
        };
        Ok(Self::new(updated_fields, removed_fields))
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(prefix: &str, path: &str) -> bool {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    }
    is_prefix(a, b) || is_prefix(b, a)
}

fn diff_into(
    ours: &Document,
    theirs: &Document,
    prefix: Option<&str>,
    out: &mut UpdateDescription,
) {
    let full_key = |key: &str| match prefix {
        Some(p) => format!("{p}.{key}"),
        None => key.to_string(),
    };

    for (key, our_value) in ours {
        if key == ID_FIELD || key == DOCUMENT_VERSION_FIELD {
            continue;
        }
        let actual_key = full_key(key);
        match theirs.get(key) {
            Some(their_value) => match (our_value, their_value) {
                (Value::Document(our_doc), Value::Document(their_doc)) => {
                    diff_into(our_doc, their_doc, Some(&actual_key), out);
                }
                _ if our_value != their_value => {
                    out.updated_fields.insert(actual_key, their_value.clone());
                }
                _ => {}
            },
            None => out.removed_fields.push(actual_key),
        }
    }

    for (key, their_value) in theirs {
        if key == ID_FIELD || key == DOCUMENT_VERSION_FIELD || ours.contains_key(key) {
            continue;
        }
        out.updated_fields.insert(full_key(key), their_value.clone());
    }
}
