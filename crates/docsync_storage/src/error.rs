//! Error types for local store operations.

use std::io;
use std::path::PathBuf;

use docsync_codec::CodecError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The store files are corrupted beyond a torn tail.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another document already uses this `_id`.
    #[error("duplicate key in {collection}: _id {id}")]
    DuplicateKey {
        /// `database.collection` of the insert.
        collection: String,
        /// Rendered `_id`.
        id: String,
    },

    /// A query filter used an unsupported or malformed operator.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// An update document was malformed or could not be applied.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The store directory is locked by another process.
    #[error("store is locked: {}", .0.display())]
    Locked(PathBuf),
}

impl StorageError {
    /// Creates an invalid filter error.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }

    /// Creates an invalid update error.
    pub fn invalid_update(message: impl Into<String>) -> Self {
        Self::InvalidUpdate(message.into())
    }

    /// True for duplicate `_id` rejections.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}
