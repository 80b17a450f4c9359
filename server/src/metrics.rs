//! Executor metrics.
//!
//! Counters are lock-free atomics; per-kind timers for single-operation
//! batches live in a [`DashMap`]. Namespace job timings also feed a
//! throughput estimate (operations per second, exponentially weighted) that
//! the adaptive sub-batch heuristic reads back.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Weight of the newest sample in the throughput estimate.
const THROUGHPUT_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct Timer {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Timer {
    fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimerSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_micros.load(Ordering::Relaxed);
        TimerSnapshot {
            count,
            total_micros: total,
            mean_micros: if count == 0 { 0 } else { total / count },
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

/// Aggregated timings of one kind of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_micros: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
}

/// Shared by every executor task.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    batches_grouped: AtomicU64,
    batches_single: AtomicU64,
    grouped_ops: AtomicU64,
    net_effects: AtomicU64,
    sub_batches: AtomicU64,
    sub_batch_ops: AtomicU64,
    applied_ops: AtomicU64,
    retries: AtomicU64,
    optimistic_fallbacks: AtomicU64,
    failures: AtomicU64,
    /// f64 bits; zero means no sample yet
    throughput_bits: AtomicU64,
    jobs: Timer,
    single_ops: DashMap<&'static str, Timer>,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A grouped batch with `ops` raw operations reduced to `effects` net effects.
    pub fn record_grouped_batch(&self, ops: usize, effects: usize) {
        self.batches_grouped.fetch_add(1, Ordering::Relaxed);
        self.grouped_ops.fetch_add(ops as u64, Ordering::Relaxed);
        self.net_effects.fetch_add(effects as u64, Ordering::Relaxed);
    }

    pub fn record_sub_batches(&self, pieces: usize, ops: usize) {
        self.sub_batches.fetch_add(pieces as u64, Ordering::Relaxed);
        self.sub_batch_ops.fetch_add(ops as u64, Ordering::Relaxed);
    }

    /// One namespace job of `ops` net effects finished in `elapsed`.
    pub fn record_job(&self, ops: usize, elapsed: Duration) {
        self.jobs.record(elapsed);
        self.applied_ops.fetch_add(ops as u64, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        if ops == 0 || secs <= 0.0 {
            return;
        }
        let sample = ops as f64 / secs;
        let _ = self
            .throughput_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if current > 0.0 {
                    THROUGHPUT_ALPHA * sample + (1.0 - THROUGHPUT_ALPHA) * current
                } else {
                    sample
                };
                Some(next.to_bits())
            });
    }

    /// A single-operation batch of the given kind finished in `elapsed`.
    pub fn record_single(&self, kind: &'static str, elapsed: Duration) {
        self.batches_single.fetch_add(1, Ordering::Relaxed);
        self.applied_ops.fetch_add(1, Ordering::Relaxed);
        self.single_ops.entry(kind).or_default().record(elapsed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_optimistic_fallback(&self) {
        self.optimistic_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Smoothed net effects applied per second, if any job has been timed.
    pub fn throughput(&self) -> Option<f64> {
        let value = f64::from_bits(self.throughput_bits.load(Ordering::Relaxed));
        (value > 0.0).then_some(value)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let grouped = load(&self.batches_grouped);
        let sub_batches = load(&self.sub_batches);

        MetricsSnapshot {
            grouped_batches: grouped,
            single_batches: load(&self.batches_single),
            mean_grouped_batch_size: mean(load(&self.grouped_ops), grouped),
            net_effects: load(&self.net_effects),
            sub_batches,
            mean_sub_batch_size: mean(load(&self.sub_batch_ops), sub_batches),
            applied_ops: load(&self.applied_ops),
            retries: load(&self.retries),
            optimistic_fallbacks: load(&self.optimistic_fallbacks),
            failures: load(&self.failures),
            throughput_ops_per_sec: self.throughput(),
            jobs: self.jobs.snapshot(),
            single_ops: self
                .single_ops
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
                .collect(),
        }
    }
}

fn mean(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// Point-in-time copy of [`ExecutorMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub grouped_batches: u64,
    pub single_batches: u64,
    pub mean_grouped_batch_size: f64,
    pub net_effects: u64,
    pub sub_batches: u64,
    pub mean_sub_batch_size: f64,
    pub applied_ops: u64,
    pub retries: u64,
    pub optimistic_fallbacks: u64,
    pub failures: u64,
    pub throughput_ops_per_sec: Option<f64>,
    pub jobs: TimerSnapshot,
    pub single_ops: BTreeMap<String, TimerSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ExecutorMetrics::new();
        metrics.record_grouped_batch(10, 4);
        metrics.record_grouped_batch(20, 6);
        metrics.record_sub_batches(3, 10);
        metrics.record_retry();
        metrics.record_optimistic_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.grouped_batches, 2);
        assert_eq!(snapshot.mean_grouped_batch_size, 15.0);
        assert_eq!(snapshot.net_effects, 10);
        assert_eq!(snapshot.sub_batches, 3);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.optimistic_fallbacks, 1);
        assert_eq!(snapshot.throughput_ops_per_sec, None);
    }

    #[test]
    fn single_op_timers_are_per_kind() {
        let metrics = ExecutorMetrics::new();
        metrics.record_single("command", Duration::from_millis(4));
        metrics.record_single("command", Duration::from_millis(2));
        metrics.record_single("insert", Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.single_batches, 3);
        assert_eq!(snapshot.single_ops["command"].count, 2);
        assert_eq!(snapshot.single_ops["command"].mean_micros, 3_000);
        assert_eq!(snapshot.single_ops["command"].max_micros, 4_000);
        assert_eq!(snapshot.single_ops["insert"].count, 1);
    }

    #[test]
    fn throughput_is_smoothed() {
        let metrics = ExecutorMetrics::new();
        metrics.record_job(100, Duration::from_secs(1));
        assert_eq!(metrics.throughput(), Some(100.0));

        metrics.record_job(200, Duration::from_secs(1));
        let smoothed = metrics.throughput().unwrap();
        assert!((smoothed - 130.0).abs() < 1e-9);
    }

    #[test]
    fn empty_jobs_do_not_move_throughput() {
        let metrics = ExecutorMetrics::new();
        metrics.record_job(0, Duration::from_millis(5));
        assert_eq!(metrics.throughput(), None);
        assert_eq!(metrics.snapshot().jobs.count, 1);
    }
}
