//! Storage backends.
//!
//! A backend hands out write transactions. Shared transactions are scoped
//! to one namespace and may run concurrently; an exclusive transaction
//! blocks every other transaction while it is open. Dropping a transaction
//! without committing it rolls it back.

mod memory;
mod postgres;

pub use memory::{MemoryBackend, MemoryStats};
pub use postgres::PgBackend;

use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oplog_engine::{ChangeOperation, DatabaseName, Document, DocumentKey, Namespace, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Internal identity of a stored document, distinct from its `_id`.
pub type InternalId = i64;

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Position of the last applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub ts: Timestamp,
    pub hash: i64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(op: &ChangeOperation) -> Self {
        Self {
            ts: op.ts(),
            hash: op.hash(),
            updated_at: Utc::now(),
        }
    }

    /// Whether `op` was already applied when this checkpoint was taken.
    pub fn covers(&self, op: &ChangeOperation) -> bool {
        op.ts() <= self.ts
    }
}

/// A document store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Open a transaction writing to one namespace.
    async fn begin(&self, namespace: &Namespace) -> BackendResult<Box<dyn WriteTransaction>>;

    /// Open a transaction that excludes every other transaction.
    async fn begin_exclusive(&self) -> BackendResult<Box<dyn ExclusiveTransaction>>;

    async fn load_checkpoint(&self) -> BackendResult<Option<Checkpoint>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BackendResult<()>;
}

/// Write access to documents inside one transaction.
#[async_trait]
pub trait WriteTransaction: Send {
    /// Resolve internal ids of the documents with the given keys. Keys with
    /// no stored document are absent from the result.
    async fn find_ids_by_keys(
        &mut self,
        namespace: &Namespace,
        keys: &[DocumentKey],
    ) -> BackendResult<HashMap<DocumentKey, InternalId>>;

    async fn fetch_documents(
        &mut self,
        namespace: &Namespace,
        ids: &[InternalId],
    ) -> BackendResult<HashMap<InternalId, Document>>;

    /// Delete documents by internal id, returning how many were removed.
    async fn delete_by_ids(&mut self, namespace: &Namespace, ids: &[InternalId])
        -> BackendResult<u64>;

    /// Insert documents. Fails with [`BackendError::UniqueViolation`] when a
    /// document with the same `_id` already exists.
    async fn insert_documents(
        &mut self,
        namespace: &Namespace,
        documents: Vec<Document>,
    ) -> BackendResult<()>;

    /// Make every write visible. The transaction is unusable afterwards.
    async fn commit(&mut self) -> BackendResult<()>;
}

/// A transaction holding the whole store.
#[async_trait]
pub trait ExclusiveTransaction: WriteTransaction {
    /// Remove every document of a namespace.
    async fn drop_collection(&mut self, namespace: &Namespace) -> BackendResult<u64>;

    /// Remove every document of a database.
    async fn drop_database(&mut self, database: &DatabaseName) -> BackendResult<u64>;

    fn as_write(&mut self) -> &mut dyn WriteTransaction;
}
