//! Protocol error types.

use docsync_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting change events and version tokens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Underlying document access failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A payload did not have the expected shape.
    #[error("decoding error: {message}")]
    Decoding {
        /// What was wrong with the payload.
        message: String,
    },

    /// A version token used an unknown sync protocol version.
    #[error("unsupported sync protocol version {version}")]
    UnsupportedProtocolVersion {
        /// The version found on the document.
        version: i64,
    },

    /// A conflict handler could not produce a resolution.
    #[error("conflict resolution failed: {message}")]
    Resolution {
        /// Why the handler gave up.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Creates a resolution error.
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }
}
