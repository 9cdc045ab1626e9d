//! Document codec trait for typed collections.

use docsync_codec::{CodecResult, Document};

/// Trait for application types stored in synchronized collections.
///
/// Implementors must provide:
/// - `to_document()`: Converts the value to a document, including `_id`
/// - `from_document()`: Builds the value from a sanitized document
///
/// The engine strips its own bookkeeping fields before calling
/// `from_document`, so implementations never see the version field.
///
/// # Example
///
/// ```rust,ignore
/// use docsync_codec::{doc, CodecResult, Document};
/// use docsync_protocol::DocumentCodec;
///
/// struct Task {
///     id: String,
///     title: String,
/// }
///
/// impl DocumentCodec for Task {
///     fn to_document(&self) -> CodecResult<Document> {
///         Ok(doc! { "_id" => self.id.as_str(), "title" => self.title.as_str() })
///     }
///
///     fn from_document(document: &Document) -> CodecResult<Self> {
///         Ok(Task {
///             id: document.require_str("_id")?.to_string(),
///             title: document.require_str("title")?.to_string(),
///         })
///     }
/// }
/// ```
pub trait DocumentCodec: Sized {
    /// Converts the value into a document.
    fn to_document(&self) -> CodecResult<Document>;

    /// Builds the value from a document.
    fn from_document(document: &Document) -> CodecResult<Self>;
}

impl DocumentCodec for Document {
    fn to_document(&self) -> CodecResult<Document> {
        Ok(self.clone())
    }

    fn from_document(document: &Document) -> CodecResult<Self> {
        Ok(document.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;

    #[derive(Debug, PartialEq)]
    struct Task {
        id: i64,
        title: String,
    }

    impl DocumentCodec for Task {
        fn to_document(&self) -> CodecResult<Document> {
            Ok(doc! { "_id" => self.id, "title" => self.title.as_str() })
        }

        fn from_document(document: &Document) -> CodecResult<Self> {
            Ok(Task {
                id: document.require_i64("_id")?,
                title: document.require_str("title")?.to_string(),
            })
        }
    }

    #[test]
    fn typed_roundtrip() {
        let task = Task {
            id: 4,
            title: "write".into(),
        };
        let d = task.to_document().unwrap();
        assert_eq!(Task::from_document(&d).unwrap(), task);
    }

    #[test]
    fn missing_field_is_reported() {
        assert!(Task::from_document(&doc! { "_id" => 1 }).is_err());
    }
}
