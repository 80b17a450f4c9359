//! Worker-pool batch executor.

use super::{execute_single, run_job, BatchExecutor, SubBatchHeuristic};
use crate::applier::OperationApplier;
use crate::backend::Backend;
use crate::error::{ReplError, Result};
use crate::metrics::ExecutorMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use oplog_engine::{Batch, BatchKind, NamespaceJob, ReplicationContext};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs the namespace jobs of a grouped batch in parallel.
///
/// Each job is cut into sub-batches sized by a [`SubBatchHeuristic`]; every
/// piece runs in its own transaction on a spawned task, at most `workers` at
/// a time. The batch completes when every piece has finished. Pieces of one
/// job hold disjoint document keys, so they never touch the same document.
#[derive(Clone)]
pub struct ConcurrentBatchExecutor {
    backend: Arc<dyn Backend>,
    applier: Arc<dyn OperationApplier>,
    metrics: Arc<ExecutorMetrics>,
    retry: RetryPolicy,
    heuristic: Arc<dyn SubBatchHeuristic>,
    permits: Arc<Semaphore>,
}

impl ConcurrentBatchExecutor {
    pub fn new(
        backend: Arc<dyn Backend>,
        applier: Arc<dyn OperationApplier>,
        heuristic: Arc<dyn SubBatchHeuristic>,
        workers: usize,
    ) -> Self {
        Self {
            backend,
            applier,
            metrics: Arc::new(ExecutorMetrics::new()),
            retry: RetryPolicy::default(),
            heuristic,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ExecutorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn execute_pieces(&self, pieces: Vec<NamespaceJob>, ctx: ReplicationContext) -> Result<()> {
        let mut tasks = JoinSet::new();
        for piece in pieces {
            let backend = Arc::clone(&self.backend);
            let metrics = Arc::clone(&self.metrics);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| ReplError::Task(e.to_string()))?;
                run_job(backend.as_ref(), &piece, &ctx, &metrics).await.map(|_| ())
            });
        }

        // a retry would re-run every piece under a reapplying context, so a
        // non-retryable failure must win over any rollback
        let mut failure: Option<ReplError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| ReplError::Task(e.to_string())).and_then(|r| r);
            if let Err(err) = result {
                match &failure {
                    Some(kept) if kept.is_retryable() && !err.is_retryable() => failure = Some(err),
                    Some(_) => {}
                    None => failure = Some(err),
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BatchExecutor for ConcurrentBatchExecutor {
    async fn execute(&self, batch: &Batch, ctx: &ReplicationContext) -> Result<()> {
        match &batch.kind {
            BatchKind::SingleOp(op) => {
                tracing::debug!(batch_id = %batch.id, kind = op.kind_name(), "Executing single op batch");
                execute_single(self.backend.as_ref(), self.applier.as_ref(), op, ctx, &self.metrics)
                    .await?;
            }
            BatchKind::Grouped(grouped) => {
                let size = self.heuristic.sub_batch_size(&self.metrics).max(1);
                let pieces: Vec<NamespaceJob> = grouped
                    .jobs()
                    .into_iter()
                    .flat_map(|job| job.split(size))
                    .collect();
                let effects = grouped.effect_count();

                self.metrics
                    .record_grouped_batch(grouped.original_ops().len(), effects);
                self.metrics.record_sub_batches(pieces.len(), effects);
                tracing::debug!(
                    batch_id = %batch.id,
                    ops = grouped.original_ops().len(),
                    effects,
                    pieces = pieces.len(),
                    sub_batch_size = size,
                    "Executing grouped batch"
                );

                self.execute_pieces(pieces, *ctx).await?;
            }
        }
        tracing::debug!(batch_id = %batch.id, "Batch applied");
        Ok(())
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn metrics(&self) -> &ExecutorMetrics {
        &self.metrics
    }
}
