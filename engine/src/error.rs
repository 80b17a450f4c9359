//! Error types for the oplog engine.

use crate::{CollectionName, DatabaseName};
use thiserror::Error;

/// All possible errors from the oplog engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Operation shape errors
    #[error("{kind} operation on {database}.{collection} carries no document key")]
    MissingDocumentKey {
        kind: &'static str,
        database: DatabaseName,
        collection: CollectionName,
    },

    #[error("{0} operation cannot be folded into a net effect")]
    NotReducible(&'static str),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    // Modification errors
    #[error("invalid modification: {0}")]
    InvalidModification(String),

    #[error("unknown update operator: {0}")]
    UnknownOperator(String),

    #[error("cannot apply {operator} to non-numeric field '{field}'")]
    NonNumericField {
        operator: &'static str,
        field: String,
    },

    #[error("cannot traverse '{path}': '{segment}' is not an object")]
    PathNotTraversable { path: String, segment: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::MissingDocumentKey {
            kind: "update",
            database: "shop".into(),
            collection: "orders".into(),
        };
        assert_eq!(
            err.to_string(),
            "update operation on shop.orders carries no document key"
        );

        let err = Error::NonNumericField {
            operator: "$inc",
            field: "name".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot apply $inc to non-numeric field 'name'"
        );

        let err = Error::UnknownOperator("$push".into());
        assert_eq!(err.to_string(), "unknown update operator: $push");
    }
}
