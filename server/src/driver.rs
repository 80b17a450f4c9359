//! Oplog applier loop.
//!
//! Pulls change operations from a stream, accumulates them into raw batches
//! bounded by [`BatchLimits`], analyzes each raw batch and hands the
//! resulting batches to a [`BatchExecutor`] in order. The representative
//! operation of each applied batch is saved as the checkpoint; operations at
//! or before the checkpoint are skipped when resuming.
//!
//! A crash can leave work committed past the checkpoint (between a commit
//! and the checkpoint write, or from some jobs of a concurrent batch). The
//! first raw batch of every run is therefore applied under
//! [`ReplicationContext::reapplying`].

use crate::backend::{Backend, Checkpoint};
use crate::error::{ReplError, Result};
use crate::executor::BatchExecutor;
use futures::{Stream, StreamExt};
use oplog_engine::{BatchAnalyzer, ChangeOperation, ReplicationContext};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::RwLock;
use tokio::time::{timeout_at, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// When a raw batch is cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Operations per raw batch.
    pub max_size: usize,
    /// How long to wait for more operations once the first one arrived.
    pub max_period: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_period: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

/// Progress of the applier loop, shared with the status routes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub run_id: Option<Uuid>,
    pub state: DriverState,
    pub applied_ops: u64,
    pub applied_batches: u64,
    pub skipped_ops: u64,
    pub checkpoint: Option<Checkpoint>,
    pub last_error: Option<String>,
}

pub type SharedStatus = Arc<RwLock<ReplicationStatus>>;

pub struct OplogApplier {
    backend: Arc<dyn Backend>,
    executor: Arc<dyn BatchExecutor>,
    analyzer: BatchAnalyzer,
    ctx: ReplicationContext,
    limits: BatchLimits,
    status: SharedStatus,
}

impl OplogApplier {
    pub fn new(backend: Arc<dyn Backend>, executor: Arc<dyn BatchExecutor>) -> Self {
        let ctx = ReplicationContext::default();
        Self {
            backend,
            executor,
            analyzer: BatchAnalyzer::new(ctx),
            ctx,
            limits: BatchLimits::default(),
            status: SharedStatus::default(),
        }
    }

    pub fn with_context(mut self, ctx: ReplicationContext) -> Self {
        self.ctx = ctx;
        self.analyzer = BatchAnalyzer::new(ctx);
        self
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Apply every operation of `source` until it ends or a batch fails.
    pub async fn run<S>(&self, source: S) -> Result<ReplicationStatus>
    where
        S: Stream<Item = Result<ChangeOperation>> + Send,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("replication", %run_id);
        async {
            {
                let mut status = self.status.write().await;
                status.run_id = Some(run_id);
                status.state = DriverState::Running;
                status.last_error = None;
            }

            let result = self.run_inner(source).await;

            let mut status = self.status.write().await;
            match result {
                Ok(()) => {
                    status.state = DriverState::Finished;
                    tracing::info!(
                        ops = status.applied_ops,
                        batches = status.applied_batches,
                        skipped = status.skipped_ops,
                        "Oplog source exhausted"
                    );
                    Ok(status.clone())
                }
                Err(err) => {
                    status.state = DriverState::Failed;
                    status.last_error = Some(err.to_string());
                    tracing::error!(error = %err, "Replication stopped");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner<S>(&self, source: S) -> Result<()>
    where
        S: Stream<Item = Result<ChangeOperation>> + Send,
    {
        let mut checkpoint = self.backend.load_checkpoint().await?;
        if let Some(cp) = &checkpoint {
            tracing::info!(ts = cp.ts, "Resuming after checkpoint");
        }
        self.status.write().await.checkpoint = checkpoint.clone();

        let mut source = std::pin::pin!(source);
        let mut recovering = true;
        loop {
            let (ops, skipped, exhausted) =
                next_raw_batch(&mut source, &self.limits, checkpoint.as_ref()).await?;
            if skipped > 0 {
                self.status.write().await.skipped_ops += skipped;
            }
            if !ops.is_empty() {
                let ctx = if recovering {
                    tracing::info!(ops = ops.len(), "Reapplying first raw batch of the run");
                    ReplicationContext::reapplying()
                } else {
                    self.ctx
                };
                recovering = false;
                if let Some(saved) = self.apply_raw_batch(&ops, ctx).await? {
                    checkpoint = Some(saved);
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    /// Analyze and apply one raw batch, checkpointing after every batch.
    /// Returns the last checkpoint saved.
    async fn apply_raw_batch(
        &self,
        ops: &[ChangeOperation],
        ctx: ReplicationContext,
    ) -> Result<Option<Checkpoint>> {
        let analyzer = if ctx == self.ctx {
            self.analyzer
        } else {
            BatchAnalyzer::new(ctx)
        };
        let batches = analyzer.analyze(ops)?;
        tracing::debug!(ops = ops.len(), batches = batches.len(), "Applying raw batch");

        let mut saved = None;
        for batch in batches {
            let count = batch.op_count() as u64;
            let applied = self.executor.apply(batch, ctx).await?;

            let checkpoint = applied.as_ref().map(Checkpoint::of);
            if let Some(checkpoint) = &checkpoint {
                self.backend.save_checkpoint(checkpoint).await?;
            }

            let mut status = self.status.write().await;
            status.applied_batches += 1;
            status.applied_ops += count;
            if let Some(checkpoint) = checkpoint {
                status.checkpoint = Some(checkpoint.clone());
                saved = Some(checkpoint);
            }
        }
        Ok(saved)
    }
}

/// Pull the next raw batch. Returns the operations, how many were skipped
/// as already applied, and whether the source ended.
async fn next_raw_batch<S>(
    source: &mut S,
    limits: &BatchLimits,
    checkpoint: Option<&Checkpoint>,
) -> Result<(Vec<ChangeOperation>, u64, bool)>
where
    S: Stream<Item = Result<ChangeOperation>> + Unpin,
{
    let max_size = limits.max_size.max(1);
    let mut ops = Vec::new();
    let mut skipped = 0;
    let mut deadline = None;

    loop {
        let next = match deadline {
            None => source.next().await,
            Some(deadline) => match timeout_at(deadline, source.next()).await {
                Ok(next) => next,
                Err(_) => return Ok((ops, skipped, false)),
            },
        };

        match next {
            None => return Ok((ops, skipped, true)),
            Some(Err(err)) => return Err(err),
            Some(Ok(op)) if checkpoint.is_some_and(|cp| cp.covers(&op)) => skipped += 1,
            Some(Ok(op)) => {
                ops.push(op);
                if ops.len() >= max_size {
                    return Ok((ops, skipped, false));
                }
                deadline.get_or_insert_with(|| Instant::now() + limits.max_period);
            }
        }
    }
}

/// Change operations read as one JSON object per line. Blank lines are
/// ignored.
pub fn json_lines<R>(reader: R) -> impl Stream<Item = Result<ChangeOperation>> + Send
where
    R: AsyncBufRead + Unpin + Send,
{
    futures::stream::unfold((reader.lines(), 0usize), |(mut lines, mut line_no)| async move {
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let op = serde_json::from_str::<ChangeOperation>(&line)
                        .map_err(|e| ReplError::Source(format!("line {line_no}: {e}")));
                    return Some((op, (lines, line_no)));
                }
                Ok(None) => return None,
                Err(e) => {
                    return Some((
                        Err(ReplError::Source(format!("line {line_no}: {e}"))),
                        (lines, line_no),
                    ))
                }
            }
        }
    })
}
