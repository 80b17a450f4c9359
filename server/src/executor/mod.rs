//! Batch execution.
//!
//! A [`BatchExecutor`] applies analyzed batches against a [`Backend`]:
//!
//! - a single-op batch runs under an exclusive transaction through the
//!   [`OperationApplier`];
//! - a grouped batch runs one shared transaction per namespace job, with a
//!   transparent pessimistic rerun when the optimistic path hits a duplicate
//!   `_id`.
//!
//! [`BatchExecutor::apply`] wraps one execution attempt in the batch retry
//! loop: a rollback conflict rebuilds the whole batch under
//! [`ReplicationContext::reapplying`] and runs it again.

mod concurrent;
mod heuristic;
mod job;

pub use concurrent::ConcurrentBatchExecutor;
pub use heuristic::{AdaptiveSubBatchHeuristic, FixedSubBatchHeuristic, SubBatchHeuristic};
pub use job::{JobOutcome, NamespaceJobExecutor};

use crate::applier::OperationApplier;
use crate::backend::Backend;
use crate::error::{JobError, ReplError, Result};
use crate::metrics::ExecutorMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use oplog_engine::{Batch, BatchKind, ChangeOperation, NamespaceJob, ReplicationContext};
use std::sync::Arc;
use std::time::Instant;

/// Executes batches produced by the batch analyzer.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// One attempt at `batch`. Nothing is retried at this level.
    async fn execute(&self, batch: &Batch, ctx: &ReplicationContext) -> Result<()>;

    fn retry_policy(&self) -> &RetryPolicy;

    fn metrics(&self) -> &ExecutorMetrics;

    /// Execute `batch`, retrying the whole batch on rollback conflicts.
    ///
    /// Returns the operation to checkpoint, `None` for an empty batch.
    async fn apply(&self, batch: Batch, ctx: ReplicationContext) -> Result<Option<ChangeOperation>> {
        let mut batch = batch;
        let mut ctx = ctx;
        let mut attempt = 1;

        loop {
            match self.execute(&batch, &ctx).await {
                Ok(()) => return Ok(batch.representative_op().cloned()),
                Err(err) if err.is_retryable() && self.retry_policy().allows_retry(attempt) => {
                    let delay = self.retry_policy().delay_for_attempt(attempt);
                    tracing::warn!(
                        batch_id = %batch.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Batch rolled back, retrying as reapply"
                    );
                    self.metrics().record_retry();
                    tokio::time::sleep(delay).await;

                    ctx = ReplicationContext::reapplying();
                    batch = batch.reanalyze(&ctx)?;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::error!(batch_id = %batch.id, attempts = attempt, error = %err, "Giving up on batch");
                    self.metrics().record_failure();
                    return Err(ReplError::RetriesExhausted {
                        batch_id: batch.id.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    tracing::error!(batch_id = %batch.id, error = %err, "Batch failed");
                    self.metrics().record_failure();
                    return Err(err);
                }
            }
        }
    }
}

/// Applies batches one job at a time.
#[derive(Clone)]
pub struct SequentialBatchExecutor {
    backend: Arc<dyn Backend>,
    applier: Arc<dyn OperationApplier>,
    metrics: Arc<ExecutorMetrics>,
    retry: RetryPolicy,
}

impl SequentialBatchExecutor {
    pub fn new(backend: Arc<dyn Backend>, applier: Arc<dyn OperationApplier>) -> Self {
        Self {
            backend,
            applier,
            metrics: Arc::new(ExecutorMetrics::new()),
            retry: RetryPolicy::default(),
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
}

#[async_trait]
impl BatchExecutor for SequentialBatchExecutor {
    async fn execute(&self, batch: &Batch, ctx: &ReplicationContext) -> Result<()> {
        tracing::debug!(
            batch_id = %batch.id,
            kind = batch.kind_name(),
            ops = batch.op_count(),
            "Executing batch"
        );
        match &batch.kind {
            BatchKind::SingleOp(op) => {
                execute_single(self.backend.as_ref(), self.applier.as_ref(), op, ctx, &self.metrics)
                    .await?
            }
            BatchKind::Grouped(grouped) => {
                self.metrics
                    .record_grouped_batch(grouped.original_ops().len(), grouped.effect_count());
                for job in grouped.jobs() {
                    run_job(self.backend.as_ref(), &job, ctx, &self.metrics).await?;
                }
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

/// Run one operation alone under an exclusive transaction.
pub(crate) async fn execute_single(
    backend: &dyn Backend,
    applier: &dyn OperationApplier,
    op: &ChangeOperation,
    ctx: &ReplicationContext,
    metrics: &ExecutorMetrics,
) -> Result<()> {
    let started = Instant::now();
    let mut tx = backend.begin_exclusive().await?;
    applier.apply(op, tx.as_mut(), ctx).await?;
    tx.commit().await?;
    metrics.record_single(op.kind_name(), started.elapsed());
    Ok(())
}

/// Run one namespace job in its own transaction.
///
/// A duplicate `_id` on the optimistic path reruns the job once
/// pessimistically. A duplicate on the pessimistic path means the reduction
/// and the store disagree, and is fatal.
pub(crate) async fn run_job(
    backend: &dyn Backend,
    job: &NamespaceJob,
    ctx: &ReplicationContext,
    metrics: &ExecutorMetrics,
) -> Result<JobOutcome> {
    let started = Instant::now();
    let optimistic = ctx.optimistic_delete_and_create();

    let outcome = match job_once(backend, job, optimistic).await {
        Err(err) if optimistic && err.is_unique_violation() => {
            tracing::warn!(
                namespace = %job.namespace(),
                ops = job.len(),
                error = %err,
                "Optimistic insert collided, rerunning job pessimistically"
            );
            metrics.record_optimistic_fallback();
            job_once(backend, job, false).await
        }
        other => other,
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) if err.is_unique_violation() => {
            return Err(ReplError::InvariantViolation {
                namespace: job.namespace().clone(),
                source: err,
            })
        }
        Err(err) => return Err(err.into()),
    };

    metrics.record_job(job.len(), started.elapsed());
    tracing::debug!(
        namespace = %job.namespace(),
        ops = outcome.ops,
        fetched = outcome.fetched,
        deleted = outcome.deleted,
        inserted = outcome.inserted,
        "Job applied"
    );
    Ok(outcome)
}

async fn job_once(
    backend: &dyn Backend,
    job: &NamespaceJob,
    optimistic: bool,
) -> std::result::Result<JobOutcome, JobError> {
    let mut tx = backend.begin(job.namespace()).await?;
    let outcome = NamespaceJobExecutor::apply(job, tx.as_mut(), optimistic).await?;
    tx.commit().await?;
    Ok(outcome)
}
