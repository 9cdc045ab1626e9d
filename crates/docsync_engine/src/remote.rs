//! Remote execution service abstraction and the collection façade built on
//! top of it.

use std::sync::Arc;
use std::time::Duration;

use docsync_codec::{Document, Value};
use docsync_protocol::{ChangeEvent, MongoNamespace};

use crate::error::{SyncError, SyncResult};

/// A remote execution service.
///
/// Every remote database operation is a named function call taking an
/// array of argument documents. Implementations must be stateless with
/// respect to the engine and safe to share across threads.
pub trait RemoteService: Send + Sync {
    /// Calls the named remote function.
    ///
    /// # Errors
    ///
    /// `Network` when the call could not be completed, `Service` when the
    /// remote rejected it.
    fn call_function(&self, name: &str, args: &[Document], timeout: Option<Duration>) -> SyncResult<Value>;
}

/// Result of a remote `insertOne`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInsertOneResult {
    /// `_id` of the inserted document.
    pub inserted_id: Value,
}

/// Result of a remote `insertMany`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInsertManyResult {
    /// `_id`s of the inserted documents, in input order.
    pub inserted_ids: Vec<Value>,
}

/// Result of a remote `updateOne` or `updateMany`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteUpdateResult {
    /// Documents matched by the filter.
    pub matched_count: i64,
    /// Documents changed.
    pub modified_count: i64,
    /// `_id` of the upserted document.
    pub upserted_id: Option<Value>,
}

/// Result of a remote `deleteOne` or `deleteMany`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteDeleteResult {
    /// Documents removed.
    pub deleted_count: i64,
}

/// One poll of a namespace change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchResponse {
    /// Events observed since the resume token, oldest first.
    pub events: Vec<ChangeEvent>,
    /// Token to resume after the last returned event.
    pub resume_token: Value,
}

impl WatchResponse {
    /// Encodes as `{events: [...], resumeToken}`.
    pub fn to_document(&self) -> Document {
        let mut document = Document::with_capacity(2);
        document.insert(
            "events",
            Value::Array(self.events.iter().map(|e| Value::Document(e.to_document())).collect()),
        );
        document.insert("resumeToken", self.resume_token.clone());
        document
    }

    /// Decodes `{events: [...], resumeToken}`.
    pub fn from_document(document: &Document) -> SyncResult<Self> {
        let events = match document.get("events") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Document(d) => Ok(ChangeEvent::from_document(d)?),
                    other => Err(SyncError::decoding(format!(
                        "watch event must be a document, found {}",
                        other.type_name()
                    ))),
                })
                .collect::<SyncResult<Vec<_>>>()?,
            Some(other) => {
                return Err(SyncError::decoding(format!(
                    "watch events must be an array, found {}",
                    other.type_name()
                )))
            }
        };
        Ok(Self {
            events,
            resume_token: document.get("resumeToken").cloned().unwrap_or(Value::Null),
        })
    }
}

/// A remote collection, addressed through [`RemoteService`] function calls.
#[derive(Clone)]
pub struct RemoteCollection {
    service: Arc<dyn RemoteService>,
    namespace: MongoNamespace,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for RemoteCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCollection")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteCollection {
    /// Creates a façade for `namespace` on `service`.
    pub fn new(service: Arc<dyn RemoteService>, namespace: MongoNamespace) -> Self {
        Self {
            service,
            namespace,
            timeout: None,
        }
    }

    /// Sets the timeout passed to every call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The namespace this collection addresses.
    pub fn namespace(&self) -> &MongoNamespace {
        &self.namespace
    }

    fn args(&self) -> Document {
        let mut args = Document::with_capacity(4);
        args.insert("database", self.namespace.database.as_str());
        args.insert("collection", self.namespace.collection.as_str());
        args
    }

    fn call(&self, name: &str, args: Document) -> SyncResult<Value> {
        self.service.call_function(name, &[args], self.timeout)
    }

    /// Documents matching `filter`, at most `limit` of them.
    pub fn find(&self, filter: &Document, limit: Option<i64>) -> SyncResult<Vec<Document>> {
        let mut args = self.args();
        args.insert("query", filter.clone());
        if let Some(limit) = limit {
            args.insert("limit", limit);
        }
        documents_of(self.call("find", args)?, "find")
    }

    /// The first document matching `filter`.
    pub fn find_one(&self, filter: &Document) -> SyncResult<Option<Document>> {
        let mut args = self.args();
        args.insert("query", filter.clone());
        match self.call("findOne", args)? {
            Value::Null => Ok(None),
            Value::Document(d) => Ok(Some(d)),
            other => Err(unexpected("findOne", &other)),
        }
    }

    /// Number of documents matching `filter`.
    pub fn count(&self, filter: &Document) -> SyncResult<i64> {
        let mut args = self.args();
        args.insert("query", filter.clone());
        let result = self.call("count", args)?;
        result.as_i64().ok_or_else(|| unexpected("count", &result))
    }

    /// Runs an aggregation pipeline.
    pub fn aggregate(&self, pipeline: &[Document]) -> SyncResult<Vec<Document>> {
        let mut args = self.args();
        args.insert(
            "pipeline",
            Value::Array(pipeline.iter().cloned().map(Value::Document).collect()),
        );
        documents_of(self.call("aggregate", args)?, "aggregate")
    }

    /// Inserts one document.
    pub fn insert_one(&self, document: &Document) -> SyncResult<RemoteInsertOneResult> {
        let mut args = self.args();
        args.insert("document", document.clone());
        let result = result_document(self.call("insertOne", args)?, "insertOne")?;
        Ok(RemoteInsertOneResult {
            inserted_id: result.get("insertedId").cloned().unwrap_or(Value::Null),
        })
    }

    /// Inserts several documents.
    pub fn insert_many(&self, documents: &[Document]) -> SyncResult<RemoteInsertManyResult> {
        let mut args = self.args();
        args.insert(
            "documents",
            Value::Array(documents.iter().cloned().map(Value::Document).collect()),
        );
        let result = result_document(self.call("insertMany", args)?, "insertMany")?;
        Ok(RemoteInsertManyResult {
            inserted_ids: result.get_array("insertedIds").map(<[Value]>::to_vec).unwrap_or_default(),
        })
    }

    /// Updates the first document matching `filter`.
    pub fn update_one(&self, filter: &Document, update: &Document, upsert: bool) -> SyncResult<RemoteUpdateResult> {
        self.update("updateOne", filter, update, upsert)
    }

    /// Updates every document matching `filter`.
    pub fn update_many(&self, filter: &Document, update: &Document, upsert: bool) -> SyncResult<RemoteUpdateResult> {
        self.update("updateMany", filter, update, upsert)
    }

    fn update(&self, name: &str, filter: &Document, update: &Document, upsert: bool) -> SyncResult<RemoteUpdateResult> {
        let mut args = self.args();
        args.insert("query", filter.clone());
        args.insert("update", update.clone());
        if upsert {
            args.insert("upsert", true);
        }
        let result = result_document(self.call(name, args)?, name)?;
        Ok(RemoteUpdateResult {
            matched_count: result.get_i64("matchedCount").unwrap_or(0),
            modified_count: result.get_i64("modifiedCount").unwrap_or(0),
            upserted_id: result.get("upsertedId").filter(|v| !v.is_null()).cloned(),
        })
    }

    /// Deletes the first document matching `filter`.
    pub fn delete_one(&self, filter: &Document) -> SyncResult<RemoteDeleteResult> {
        self.delete("deleteOne", filter)
    }

    /// Deletes every document matching `filter`.
    pub fn delete_many(&self, filter: &Document) -> SyncResult<RemoteDeleteResult> {
        self.delete("deleteMany", filter)
    }

    fn delete(&self, name: &str, filter: &Document) -> SyncResult<RemoteDeleteResult> {
        let mut args = self.args();
        args.insert("query", filter.clone());
        let result = result_document(self.call(name, args)?, name)?;
        Ok(RemoteDeleteResult {
            deleted_count: result.get_i64("deletedCount").unwrap_or(0),
        })
    }

    /// Polls the change stream for `ids`, resuming after `resume_after`.
    ///
    /// Without a resume token the stream opens at the current position and
    /// returns no events.
    pub fn watch(&self, ids: &[Value], resume_after: Option<&Value>) -> SyncResult<WatchResponse> {
        let mut args = self.args();
        args.insert("ids", Value::Array(ids.to_vec()));
        if let Some(token) = resume_after {
            args.insert("resumeAfter", token.clone());
        }
        let result = result_document(self.call("watch", args)?, "watch")?;
        WatchResponse::from_document(&result)
    }
}

fn unexpected(function: &str, value: &Value) -> SyncError {
    SyncError::decoding(format!("unexpected {} result from {function}", value.type_name()))
}

fn result_document(value: Value, function: &str) -> SyncResult<Document> {
    match value {
        Value::Document(d) => Ok(d),
        other => Err(unexpected(function, &other)),
    }
}

fn documents_of(value: Value, function: &str) -> SyncResult<Vec<Document>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Document(d) => Ok(d),
                other => Err(unexpected(function, &other)),
            })
            .collect(),
        other => Err(unexpected(function, &other)),
    }
}
