//! Documents and document keys.
//!
//! A document is a JSON object. Every replicated document is identified by
//! the value of its `_id` field, wrapped in a [`DocumentKey`] so it can be
//! used as a map key.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Name of the identity field of every document.
pub const ID_FIELD: &str = "_id";

/// A document stored in a collection.
pub type Document = Map<String, Value>;

/// The `_id` value of a document.
///
/// Equality follows JSON value equality. Hashing and ordering use the
/// canonical JSON text, which is stable because object keys are kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(Value);

impl DocumentKey {
    /// Wrap a JSON value as a document key.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Get the key of a document, if it has one.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get(ID_FIELD).map(|v| Self(v.clone()))
    }

    /// The wrapped `_id` value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Canonical text form, used by storage backends as a lookup column.
    pub fn canonical(&self) -> String {
        self.0.to_string()
    }

    /// Build the minimal document `{_id: key}` used to seed upserts.
    pub fn seed_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), self.0.clone());
        doc
    }
}

impl Hash for DocumentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<i64> for DocumentKey {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

/// Interpret a JSON value as a document.
pub fn as_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidDocument(format!(
            "expected an object, got {other}"
        ))),
    }
}
