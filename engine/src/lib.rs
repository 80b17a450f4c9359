//! # Oplog Engine
//!
//! Deterministic core of oplog-driven replication into a document store.
//!
//! Upstream change operations arrive as an ordered stream. Applying them one
//! by one is slow, so this crate coalesces every run of operations on the
//! same document into a single net effect and partitions the stream into
//! batches that are either safe to execute in parallel or must stay strictly
//! ordered. The final state after executing the batches matches sequential
//! replay of the stream.
//!
//! ## Design Principles
//!
//! - **No IO**: storage, transactions and scheduling live in `oplog-server`
//! - **Deterministic**: the same operations and context always produce the
//!   same batches and net effects
//! - **Immutable accumulators**: every fold step yields a new value
//!
//! ## Core Concepts
//!
//! ### Net effects
//!
//! A [`NetEffectKind`] summarises what a sequence of operations does to one
//! document. Folding an operation into it is a lookup in a fixed transition
//! table. Each kind tells the executor whether the stored document must exist
//! ([`NetEffectKind::requires_match`]), must be fetched
//! ([`NetEffectKind::requires_fetch`]) or must be deleted
//! ([`NetEffectKind::deletes`]).
//!
//! ### Analyzed operations
//!
//! An [`AnalyzedOp`] pairs a net-effect kind with a deferred [`Producer`] of
//! the document to insert. The [`Reducer`] folds operations into one
//! analyzed op per document key.
//!
//! ### Batches
//!
//! The [`BatchAnalyzer`] cuts the stream at commands and at writes to
//! protected namespaces. Everything between two such barriers becomes one
//! grouped batch, split by namespace into [`NamespaceJob`]s.
//!
//! ## Quick Start
//!
//! ```rust
//! use oplog_engine::{
//!     as_document, BatchAnalyzer, BatchKind, ChangeOperation, InsertOp, NetEffectKind,
//!     ReplicationContext, UpdateOp,
//! };
//! use serde_json::json;
//!
//! let ops = vec![
//!     ChangeOperation::Insert(InsertOp::new(
//!         1,
//!         0,
//!         "shop",
//!         "orders",
//!         as_document(json!({"_id": "o1", "total": 3})).unwrap(),
//!     )),
//!     ChangeOperation::Update(UpdateOp::new(
//!         2,
//!         0,
//!         "shop",
//!         "orders",
//!         as_document(json!({"_id": "o1"})).unwrap(),
//!         as_document(json!({"$inc": {"total": 2}})).unwrap(),
//!         false,
//!     )),
//! ];
//!
//! let batches = BatchAnalyzer::new(ReplicationContext::default())
//!     .analyze(&ops)
//!     .unwrap();
//! assert_eq!(batches.len(), 1);
//!
//! let BatchKind::Grouped(grouped) = &batches[0].kind else { unreachable!() };
//! let jobs = grouped.jobs();
//! let op = &jobs[0].ops()[0];
//! assert_eq!(op.kind(), NetEffectKind::DeleteCreate);
//! assert_eq!(
//!     op.produce(None).unwrap(),
//!     Some(as_document(json!({"_id": "o1", "total": 5})).unwrap())
//! );
//! ```

pub mod analyzed;
pub mod batch;
pub mod context;
pub mod document;
pub mod effect;
pub mod error;
pub mod job;
pub mod operation;
pub mod reducer;
pub mod update;

// Re-export main types at crate root
pub use analyzed::{AnalyzedOp, Mismatch, Producer};
pub use batch::{Batch, BatchAnalyzer, BatchId, BatchKind, GroupedBatch};
pub use context::ReplicationContext;
pub use document::{as_document, Document, DocumentKey, ID_FIELD};
pub use effect::{IncomingKind, NetEffectKind};
pub use error::{Error, Result};
pub use job::NamespaceJob;
pub use operation::{
    ChangeOperation, CommandOp, DeleteOp, InsertOp, Namespace, NoopOp, UpdateOp,
    PROTECTED_COLLECTIONS,
};
pub use reducer::{EffectTable, Reducer};
pub use update::{FieldUpdate, UpdateAction};

/// Type aliases for clarity
pub type DatabaseName = String;
pub type CollectionName = String;
pub type Timestamp = u64;
