//! Sub-batch sizing for the concurrent executor.

use crate::metrics::ExecutorMetrics;
use std::fmt::Debug;
use std::time::Duration;

/// Decides how many net effects go into one sub-batch.
///
/// Recomputed once per grouped batch. The result is always at least 1.
pub trait SubBatchHeuristic: Send + Sync + Debug {
    fn sub_batch_size(&self, metrics: &ExecutorMetrics) -> usize;
}

/// Always the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSubBatchHeuristic(pub usize);

impl SubBatchHeuristic for FixedSubBatchHeuristic {
    fn sub_batch_size(&self, _metrics: &ExecutorMetrics) -> usize {
        self.0.max(1)
    }
}

/// Sizes sub-batches so that one takes about `target_latency` at the
/// throughput observed so far, clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSubBatchHeuristic {
    pub min: usize,
    pub max: usize,
    pub target_latency: Duration,
}

impl Default for AdaptiveSubBatchHeuristic {
    fn default() -> Self {
        Self {
            min: 16,
            max: 1_000,
            target_latency: Duration::from_millis(50),
        }
    }
}

impl SubBatchHeuristic for AdaptiveSubBatchHeuristic {
    fn sub_batch_size(&self, metrics: &ExecutorMetrics) -> usize {
        let min = self.min.max(1);
        let max = self.max.max(min);
        match metrics.throughput() {
            Some(ops_per_sec) => {
                let wanted = ops_per_sec * self.target_latency.as_secs_f64();
                if wanted.is_finite() {
                    (wanted.round() as usize).clamp(min, max)
                } else {
                    max
                }
            }
            None => max,
        }
    }
}
