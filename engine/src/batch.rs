//! Batch model and batch analyzer.
//!
//! The analyzer cuts an ordered operation list into batches:
//!
//! - runs of ordinary inserts, updates and deletes become one
//!   [`BatchKind::Grouped`] batch, reduced to one net effect per document;
//! - commands and writes to protected namespaces become a
//!   [`BatchKind::SingleOp`] batch each, acting as a barrier: everything
//!   before them is flushed first and nothing after them is folded across.
//!
//! No-op markers are dropped.

use crate::analyzed::AnalyzedOp;
use crate::context::ReplicationContext;
use crate::document::DocumentKey;
use crate::job::NamespaceJob;
use crate::operation::{ChangeOperation, Namespace};
use crate::reducer::{EffectTable, Reducer};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a batch, unrelated to its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A reduced run of CUD operations over any number of namespaces.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedBatch {
    table: BTreeMap<Namespace, EffectTable>,
    original_ops: Vec<ChangeOperation>,
}

impl GroupedBatch {
    /// Reduce `ops` per namespace.
    pub fn reduce(reducer: &Reducer, ops: Vec<ChangeOperation>) -> Result<Self> {
        let mut table: BTreeMap<Namespace, EffectTable> = BTreeMap::new();
        for op in &ops {
            // Only CUD operations reach here, and those always have a namespace.
            let Some(namespace) = op.namespace() else {
                continue;
            };
            reducer.reduce_one(table.entry(namespace).or_default(), op)?;
        }
        Ok(Self {
            table,
            original_ops: ops,
        })
    }

    pub fn table(&self) -> &BTreeMap<Namespace, EffectTable> {
        &self.table
    }

    /// The raw operations, in stream order.
    pub fn original_ops(&self) -> &[ChangeOperation] {
        &self.original_ops
    }

    /// Number of distinct documents touched.
    pub fn effect_count(&self) -> usize {
        self.table.values().map(BTreeMap::len).sum()
    }

    /// Look up the net effect on one document.
    pub fn effect(&self, namespace: &Namespace, key: &DocumentKey) -> Option<&AnalyzedOp> {
        self.table.get(namespace).and_then(|t| t.get(key))
    }

    /// One job per namespace.
    pub fn jobs(&self) -> Vec<NamespaceJob> {
        self.table
            .iter()
            .map(|(ns, effects)| NamespaceJob::new(ns.clone(), effects.values().cloned().collect()))
            .collect()
    }
}

/// The two ways a batch is executed.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchKind {
    /// One operation, applied alone under an exclusive transaction.
    SingleOp(ChangeOperation),
    /// Reduced CUD operations, applied per namespace.
    Grouped(GroupedBatch),
}

/// A unit of execution produced by the [`BatchAnalyzer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub kind: BatchKind,
}

impl Batch {
    pub fn single(op: ChangeOperation) -> Self {
        Self {
            id: BatchId::new(),
            kind: BatchKind::SingleOp(op),
        }
    }

    pub fn grouped(grouped: GroupedBatch) -> Self {
        Self {
            id: BatchId::new(),
            kind: BatchKind::Grouped(grouped),
        }
    }

    /// The operation reported upstream once the batch is applied.
    pub fn representative_op(&self) -> Option<&ChangeOperation> {
        match &self.kind {
            BatchKind::SingleOp(op) => Some(op),
            BatchKind::Grouped(grouped) => grouped.original_ops.last(),
        }
    }

    /// Number of raw operations in the batch.
    pub fn op_count(&self) -> usize {
        match &self.kind {
            BatchKind::SingleOp(_) => 1,
            BatchKind::Grouped(grouped) => grouped.original_ops.len(),
        }
    }

    /// Rebuild this batch from its raw operations under another context,
    /// keeping its id.
    pub fn reanalyze(&self, ctx: &ReplicationContext) -> Result<Self> {
        let kind = match &self.kind {
            BatchKind::SingleOp(op) => BatchKind::SingleOp(op.clone()),
            BatchKind::Grouped(grouped) => BatchKind::Grouped(GroupedBatch::reduce(
                &Reducer::new(*ctx),
                grouped.original_ops.clone(),
            )?),
        };
        Ok(Self { id: self.id, kind })
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            BatchKind::SingleOp(_) => "single",
            BatchKind::Grouped(_) => "grouped",
        }
    }
}

/// Splits an ordered operation list into batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchAnalyzer {
    reducer: Reducer,
}

impl BatchAnalyzer {
    pub fn new(ctx: ReplicationContext) -> Self {
        Self {
            reducer: Reducer::new(ctx),
        }
    }

    /// Keep the raw operations behind every net effect.
    pub fn with_provenance(mut self) -> Self {
        self.reducer = self.reducer.with_provenance();
        self
    }

    /// Whether an operation must run alone, in stream order.
    pub fn is_barrier(op: &ChangeOperation) -> bool {
        match op {
            ChangeOperation::Command(_) => true,
            _ => op.namespace().is_some_and(|ns| ns.is_protected()),
        }
    }

    /// Analyze `ops` in a single left-to-right pass.
    pub fn analyze(&self, ops: &[ChangeOperation]) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        let mut run = Vec::new();

        for op in ops {
            if Self::is_barrier(op) {
                self.flush(&mut run, &mut batches)?;
                batches.push(Batch::single(op.clone()));
            } else if op.is_cud() {
                run.push(op.clone());
            }
        }
        self.flush(&mut run, &mut batches)?;

        Ok(batches)
    }

    fn flush(&self, run: &mut Vec<ChangeOperation>, batches: &mut Vec<Batch>) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let grouped = GroupedBatch::reduce(&self.reducer, std::mem::take(run))?;
        batches.push(Batch::grouped(grouped));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::as_document;
    use crate::effect::NetEffectKind;
    use crate::operation::{CommandOp, InsertOp, NoopOp, UpdateOp};
    use serde_json::json;

    fn insert(ts: u64, collection: &str, id: i64) -> ChangeOperation {
        ChangeOperation::Insert(InsertOp::new(
            ts,
            0,
            "d",
            collection,
            as_document(json!({"_id": id})).unwrap(),
        ))
    }

    fn command(ts: u64) -> ChangeOperation {
        ChangeOperation::Command(CommandOp::new(
            ts,
            0,
            "d",
            as_document(json!({"create": "c2"})).unwrap(),
        ))
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(BatchAnalyzer::default().analyze(&[]).unwrap().is_empty());
    }

    #[test]
    fn noops_are_skipped() {
        let ops = vec![
            ChangeOperation::Noop(NoopOp::new(1, 0)),
            insert(2, "c", 1),
            ChangeOperation::Noop(NoopOp::new(3, 0)),
        ];
        let batches = BatchAnalyzer::default().analyze(&ops).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].op_count(), 1);
        assert_eq!(batches[0].representative_op(), Some(&ops[1]));
    }

    #[test]
    fn namespaces_are_reduced_separately() {
        let ops = vec![insert(1, "a", 1), insert(2, "b", 1)];
        let batches = BatchAnalyzer::default().analyze(&ops).unwrap();
        let BatchKind::Grouped(grouped) = &batches[0].kind else {
            panic!("expected grouped batch");
        };
        assert_eq!(grouped.table().len(), 2);
        assert_eq!(grouped.effect_count(), 2);
        assert_eq!(grouped.jobs().len(), 2);
        assert_eq!(
            grouped
                .effect(&Namespace::new("d", "a"), &DocumentKey::from(1))
                .map(AnalyzedOp::kind),
            Some(NetEffectKind::DeleteCreate)
        );
    }

    #[test]
    fn protected_namespace_is_a_barrier() {
        let ops = vec![
            insert(1, "c", 1),
            insert(2, "system.js", 7),
            insert(3, "c", 2),
        ];
        let batches = BatchAnalyzer::default().analyze(&ops).unwrap();
        let kinds: Vec<_> = batches.iter().map(Batch::kind_name).collect();
        assert_eq!(kinds, ["grouped", "single", "grouped"]);
    }

    #[test]
    fn consecutive_barriers_produce_no_empty_groups() {
        let ops = vec![command(1), command(2)];
        let batches = BatchAnalyzer::default().analyze(&ops).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| matches!(b.kind, BatchKind::SingleOp(_))));
    }

    #[test]
    fn reanalyze_treats_updates_as_upserts() {
        let ops = vec![ChangeOperation::Update(UpdateOp::new(
            1,
            0,
            "d",
            "c",
            as_document(json!({"_id": 1})).unwrap(),
            as_document(json!({"$inc": {"n": 1}})).unwrap(),
            false,
        ))];
        let batch = BatchAnalyzer::default().analyze(&ops).unwrap().remove(0);
        let retried = batch.reanalyze(&ReplicationContext::reapplying()).unwrap();

        assert_eq!(retried.id, batch.id);
        let BatchKind::Grouped(grouped) = &retried.kind else {
            panic!("expected grouped batch");
        };
        let key = DocumentKey::from(1);
        assert_eq!(
            grouped
                .effect(&Namespace::new("d", "c"), &key)
                .map(AnalyzedOp::kind),
            Some(NetEffectKind::UpsertMod)
        );
    }

    #[test]
    fn batch_ids_are_distinct() {
        let ops = vec![insert(1, "c", 1), command(2), insert(3, "c", 1)];
        let batches = BatchAnalyzer::default().analyze(&ops).unwrap();
        assert_ne!(batches[0].id, batches[2].id);
    }
}
