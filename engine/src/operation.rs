//! Change operations read from the upstream oplog.
//!
//! Each operation records one mutation (or a command) on the source. They
//! arrive already parsed; this module only exposes what replication needs to
//! decide how an operation is treated.

use crate::document::{Document, DocumentKey};
use crate::update::UpdateAction;
use crate::{CollectionName, DatabaseName, Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Collections whose writes must be applied one by one, in stream order.
pub const PROTECTED_COLLECTIONS: [&str; 4] = [
    "system.namespaces",
    "system.indexes",
    "system.profile",
    "system.js",
];

/// A `(database, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: DatabaseName,
    pub collection: CollectionName,
}

impl Namespace {
    pub fn new(database: impl Into<DatabaseName>, collection: impl Into<CollectionName>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Whether writes to this namespace act as a barrier.
    pub fn is_protected(&self) -> bool {
        PROTECTED_COLLECTIONS.contains(&self.collection.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// An insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOp {
    /// Oplog timestamp
    pub ts: Timestamp,
    /// Oplog entry hash
    pub hash: i64,
    pub database: DatabaseName,
    pub collection: CollectionName,
    /// Inserted document, including `_id`
    pub document: Document,
}

/// An update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOp {
    pub ts: Timestamp,
    pub hash: i64,
    pub database: DatabaseName,
    pub collection: CollectionName,
    /// Match filter; carries the `_id` of the target document
    pub filter: Document,
    /// Set-style replacement or Mod-style operators
    pub modification: Document,
    #[serde(default)]
    pub upsert: bool,
}

/// A delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOp {
    pub ts: Timestamp,
    pub hash: i64,
    pub database: DatabaseName,
    pub collection: CollectionName,
    /// Match filter; carries the `_id` of the target document
    pub filter: Document,
    #[serde(default = "default_just_one")]
    pub just_one: bool,
}

fn default_just_one() -> bool {
    true
}

/// A database command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOp {
    pub ts: Timestamp,
    pub hash: i64,
    pub database: DatabaseName,
    /// Command document; its first key names the command
    pub command: Document,
}

/// A no-op or database-only marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoopOp {
    pub ts: Timestamp,
    pub hash: i64,
    #[serde(default)]
    pub database: Option<DatabaseName>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

/// A change operation from the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    Command(CommandOp),
    Noop(NoopOp),
}

impl ChangeOperation {
    /// Short name of the operation kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ChangeOperation::Insert(_) => "insert",
            ChangeOperation::Update(_) => "update",
            ChangeOperation::Delete(_) => "delete",
            ChangeOperation::Command(_) => "command",
            ChangeOperation::Noop(_) => "noop",
        }
    }

    /// Oplog timestamp of this operation.
    pub fn ts(&self) -> Timestamp {
        match self {
            ChangeOperation::Insert(op) => op.ts,
            ChangeOperation::Update(op) => op.ts,
            ChangeOperation::Delete(op) => op.ts,
            ChangeOperation::Command(op) => op.ts,
            ChangeOperation::Noop(op) => op.ts,
        }
    }

    /// Oplog hash of this operation.
    pub fn hash(&self) -> i64 {
        match self {
            ChangeOperation::Insert(op) => op.hash,
            ChangeOperation::Update(op) => op.hash,
            ChangeOperation::Delete(op) => op.hash,
            ChangeOperation::Command(op) => op.hash,
            ChangeOperation::Noop(op) => op.hash,
        }
    }

    /// Database this operation targets, if any.
    pub fn database(&self) -> Option<&DatabaseName> {
        match self {
            ChangeOperation::Insert(op) => Some(&op.database),
            ChangeOperation::Update(op) => Some(&op.database),
            ChangeOperation::Delete(op) => Some(&op.database),
            ChangeOperation::Command(op) => Some(&op.database),
            ChangeOperation::Noop(op) => op.database.as_ref(),
        }
    }

    /// Namespace of a CUD operation; `None` for commands and no-ops.
    pub fn namespace(&self) -> Option<Namespace> {
        match self {
            ChangeOperation::Insert(op) => Some(Namespace::new(&op.database, &op.collection)),
            ChangeOperation::Update(op) => Some(Namespace::new(&op.database, &op.collection)),
            ChangeOperation::Delete(op) => Some(Namespace::new(&op.database, &op.collection)),
            ChangeOperation::Command(_) | ChangeOperation::Noop(_) => None,
        }
    }

    /// Whether this is an insert, update or delete.
    pub fn is_cud(&self) -> bool {
        matches!(
            self,
            ChangeOperation::Insert(_) | ChangeOperation::Update(_) | ChangeOperation::Delete(_)
        )
    }

    /// Key of the document a CUD operation targets.
    ///
    /// Fails for CUD operations whose document or filter has no `_id`, and
    /// for commands and no-ops, which target no single document.
    pub fn document_key(&self) -> Result<DocumentKey> {
        let (source, database, collection) = match self {
            ChangeOperation::Insert(op) => (&op.document, &op.database, &op.collection),
            ChangeOperation::Update(op) => (&op.filter, &op.database, &op.collection),
            ChangeOperation::Delete(op) => (&op.filter, &op.database, &op.collection),
            ChangeOperation::Command(op) => {
                return Err(Error::MissingDocumentKey {
                    kind: self.kind_name(),
                    database: op.database.clone(),
                    collection: String::new(),
                })
            }
            ChangeOperation::Noop(op) => {
                return Err(Error::MissingDocumentKey {
                    kind: self.kind_name(),
                    database: op.database.clone().unwrap_or_default(),
                    collection: String::new(),
                })
            }
        };
        DocumentKey::of(source).ok_or_else(|| Error::MissingDocumentKey {
            kind: self.kind_name(),
            database: database.clone(),
            collection: collection.clone(),
        })
    }
}

impl InsertOp {
    pub fn new(
        ts: Timestamp,
        hash: i64,
        database: impl Into<DatabaseName>,
        collection: impl Into<CollectionName>,
        document: Document,
    ) -> Self {
        Self {
            ts,
            hash,
            database: database.into(),
            collection: collection.into(),
            document,
        }
    }
}

impl UpdateOp {
    pub fn new(
        ts: Timestamp,
        hash: i64,
        database: impl Into<DatabaseName>,
        collection: impl Into<CollectionName>,
        filter: Document,
        modification: Document,
        upsert: bool,
    ) -> Self {
        Self {
            ts,
            hash,
            database: database.into(),
            collection: collection.into(),
            filter,
            modification,
            upsert,
        }
    }

    /// Parse the modification of this update.
    pub fn action(&self) -> Result<UpdateAction> {
        UpdateAction::parse(&self.modification)
    }
}

impl DeleteOp {
    pub fn new(
        ts: Timestamp,
        hash: i64,
        database: impl Into<DatabaseName>,
        collection: impl Into<CollectionName>,
        filter: Document,
    ) -> Self {
        Self {
            ts,
            hash,
            database: database.into(),
            collection: collection.into(),
            filter,
            just_one: true,
        }
    }
}

impl CommandOp {
    pub fn new(
        ts: Timestamp,
        hash: i64,
        database: impl Into<DatabaseName>,
        command: Document,
    ) -> Self {
        Self {
            ts,
            hash,
            database: database.into(),
            command,
        }
    }

    /// Some key of the command document that is not a `$`-prefixed
    /// envelope field. Documents do not keep key order, so with option
    /// fields present this is not necessarily the command; prefer
    /// [`CommandOp::find_name`] when the candidates are known.
    pub fn name(&self) -> Option<&str> {
        self.command
            .keys()
            .map(String::as_str)
            .find(|key| !key.starts_with('$'))
    }

    /// The first of `known` that is a key of the command document.
    pub fn find_name<'a>(&self, known: &[&'a str]) -> Option<&'a str> {
        known
            .iter()
            .copied()
            .find(|name| self.command.contains_key(*name))
    }
}

impl NoopOp {
    pub fn new(ts: Timestamp, hash: i64) -> Self {
        Self {
            ts,
            hash,
            database: None,
            message: None,
        }
    }
}
