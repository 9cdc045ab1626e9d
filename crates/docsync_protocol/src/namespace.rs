//! Database/collection namespaces.

use std::fmt;

use docsync_codec::{doc, Document};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MongoNamespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl MongoNamespace {
    /// Creates a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses `db.coll`; the collection part may itself contain dots.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (database, collection) = full_name.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    /// Encodes as `{db, coll}`.
    pub fn to_document(&self) -> Document {
        doc! { "db" => self.database.as_str(), "coll" => self.collection.as_str() }
    }

    /// Decodes from `{db, coll}`.
    pub fn from_document(document: &Document) -> ProtocolResult<Self> {
        let database = document.require_str("db")?;
        let collection = document.require_str("coll")?;
        if database.is_empty() {
            return Err(ProtocolError::decoding("namespace database is empty"));
        }
        Ok(Self::new(database, collection))
    }
}

impl fmt::Display for MongoNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let ns = MongoNamespace::parse("shop.orders.archive").unwrap();
        assert_eq!(ns.database, "shop");
        assert_eq!(ns.collection, "orders.archive");
        assert_eq!(ns.to_string(), "shop.orders.archive");
        assert!(MongoNamespace::parse("nodot").is_none());
    }

    #[test]
    fn document_form() {
        let ns = MongoNamespace::new("db", "coll");
        assert_eq!(MongoNamespace::from_document(&ns.to_document()).unwrap(), ns);
    }
}
