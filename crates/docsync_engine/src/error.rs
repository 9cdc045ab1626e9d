//! Error types for the sync engine.

use docsync_codec::CodecError;
use docsync_protocol::ProtocolError;
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Service error code used by the remote for database-level rejections.
pub const MONGODB_ERROR_CODE: &str = "MongoDBError";

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A remote call could not be completed.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The remote rejected the operation.
    #[error("service error ({code}): {message}")]
    Service {
        /// Service error code, e.g. `MongoDBError`.
        code: String,
        /// Error message as reported by the remote.
        message: String,
    },

    /// A payload did not match the expected shape.
    #[error("decoding error: {message}")]
    Decoding {
        /// What was wrong with the payload.
        message: String,
    },

    /// The conflict handler failed or returned an inconsistent resolution.
    #[error("conflict unresolved for document {document_id}: {message}")]
    ConflictUnresolved {
        /// Display form of the conflicted `_id`.
        document_id: String,
        /// Why the resolution was rejected.
        message: String,
    },

    /// Internal bookkeeping is inconsistent, e.g. a leaked undo entry.
    #[error("consistency violation: {message}")]
    ConsistencyViolation {
        /// What was found.
        message: String,
    },

    /// A pending write referred to a local document that is gone.
    #[error("document does not exist: {message}")]
    DocumentDoesNotExist {
        /// Error message.
        message: String,
    },

    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Document encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Change event or version token failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No conflict handler has been configured for the namespace.
    #[error("namespace {namespace} is not configured")]
    NotConfigured {
        /// The namespace, as `db.coll`.
        namespace: String,
    },

    /// The namespace has never been configured or synchronized.
    #[error("namespace {namespace} not found")]
    NamespaceNotFound {
        /// The namespace, as `db.coll`.
        namespace: String,
    },

    /// The engine was stopped or is being reinitialized.
    #[error("sync cancelled")]
    Cancelled,

    /// Unrecoverable engine failure.
    #[error("fatal sync error: {message}")]
    Fatal {
        /// Error message.
        message: String,
    },
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a service error.
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Creates a conflict-unresolved error.
    pub fn conflict_unresolved(document_id: impl ToString, message: impl Into<String>) -> Self {
        Self::ConflictUnresolved {
            document_id: document_id.to_string(),
            message: message.into(),
        }
    }

    /// Creates a consistency violation.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }

    /// Returns true for a remote unique-index rejection.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            SyncError::Service { code, message } => {
                code == MONGODB_ERROR_CODE && message.contains("E11000")
            }
            SyncError::Storage(e) => e.is_duplicate_key(),
            _ => false,
        }
    }
}
