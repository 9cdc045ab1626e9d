//! Change operation types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A new document.
    Insert,
    /// A removed document.
    Delete,
    /// A whole-document replacement.
    Replace,
    /// A field-level update.
    Update,
    /// Anything the engine does not understand.
    Unknown,
}

impl OperationType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Update => "update",
            OperationType::Unknown => "unknown",
        }
    }

    /// Parses a wire name; unrecognised names become `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "insert" => OperationType::Insert,
            "delete" => OperationType::Delete,
            "replace" => OperationType::Replace,
            "update" => OperationType::Update,
            _ => OperationType::Unknown,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for op in [
            OperationType::Insert,
            OperationType::Delete,
            OperationType::Replace,
            OperationType::Update,
            OperationType::Unknown,
        ] {
            assert_eq!(OperationType::parse(op.as_str()), op);
        }
    }

    #[test]
    fn unrecognised_is_unknown() {
        assert_eq!(OperationType::parse("drop"), OperationType::Unknown);
        assert_eq!(OperationType::parse(""), OperationType::Unknown);
    }
}
