//! Execution of one namespace job inside one transaction.

use crate::backend::{InternalId, WriteTransaction};
use crate::error::JobError;
use oplog_engine::{DocumentKey, NamespaceJob, NetEffectKind};
use serde::Serialize;
use std::collections::HashMap;

/// What a job did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub ops: usize,
    pub fetched: usize,
    pub deleted: u64,
    pub inserted: usize,
}

/// Resolves a [`NamespaceJob`] against a transaction.
///
/// The job is applied in five steps: resolve internal ids, validate that
/// every document that must exist was found, fetch the documents needed to
/// compute results, delete, insert. Validation runs before any write, so a
/// job with a mismatch writes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceJobExecutor;

impl NamespaceJobExecutor {
    /// Apply `job` within `tx`. With `optimistic`, delete-and-create ops
    /// skip the id lookup and insert directly.
    pub async fn apply(
        job: &NamespaceJob,
        tx: &mut dyn WriteTransaction,
        optimistic: bool,
    ) -> Result<JobOutcome, JobError> {
        let namespace = job.namespace();
        let ops = job.ops();
        let mut outcome = JobOutcome {
            ops: ops.len(),
            ..JobOutcome::default()
        };

        // 1. identities
        let lookup: Vec<DocumentKey> = ops
            .iter()
            .filter(|op| op.kind().requires_identity())
            .filter(|op| !(optimistic && op.kind() == NetEffectKind::DeleteCreate))
            .map(|op| op.key().clone())
            .collect();
        let ids: HashMap<DocumentKey, InternalId> = if lookup.is_empty() {
            HashMap::new()
        } else {
            tx.find_ids_by_keys(namespace, &lookup).await?
        };

        // 2. validation
        let mismatches: Vec<_> = ops
            .iter()
            .filter(|op| !ids.contains_key(op.key()))
            .filter_map(|op| op.mismatch())
            .collect();
        if !mismatches.is_empty() {
            return Err(JobError::Mismatch {
                namespace: namespace.clone(),
                mismatches,
            });
        }

        // 3. documents
        let fetch: Vec<InternalId> = ops
            .iter()
            .filter(|op| op.kind().requires_fetch())
            .filter_map(|op| ids.get(op.key()).copied())
            .collect();
        let fetched = if fetch.is_empty() {
            HashMap::new()
        } else {
            tx.fetch_documents(namespace, &fetch).await?
        };
        outcome.fetched = fetched.len();

        // 4. delete
        let delete: Vec<InternalId> = ops
            .iter()
            .filter(|op| op.kind().deletes())
            .filter_map(|op| ids.get(op.key()).copied())
            .collect();
        if !delete.is_empty() {
            outcome.deleted = tx.delete_by_ids(namespace, &delete).await?;
        }

        // 5. insert
        let mut documents = Vec::new();
        for op in ops {
            let current = if op.kind().requires_fetch() {
                ids.get(op.key()).and_then(|id| fetched.get(id))
            } else {
                None
            };
            if let Some(doc) = op.produce(current)? {
                documents.push(doc);
            }
        }
        outcome.inserted = documents.len();
        if !documents.is_empty() {
            tx.insert_documents(namespace, documents).await?;
        }

        Ok(outcome)
    }
}
