//! Reduced workload for one namespace.

use crate::analyzed::AnalyzedOp;
use crate::operation::Namespace;

/// The analyzed ops of one grouped batch that target one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceJob {
    namespace: Namespace,
    ops: Vec<AnalyzedOp>,
}

impl NamespaceJob {
    pub fn new(namespace: Namespace, ops: Vec<AnalyzedOp>) -> Self {
        Self { namespace, ops }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn ops(&self) -> &[AnalyzedOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Split into jobs of at most `max_ops` ops each.
    ///
    /// Every op ends up in exactly one piece. A job that already fits is
    /// returned as is.
    pub fn split(self, max_ops: usize) -> Vec<NamespaceJob> {
        let max_ops = max_ops.max(1);
        if self.ops.len() <= max_ops {
            return vec![self];
        }
        let namespace = self.namespace;
        self.ops
            .chunks(max_ops)
            .map(|chunk| NamespaceJob::new(namespace.clone(), chunk.to_vec()))
            .collect()
    }
}
