//! Oplog replication service.
//!
//! Applies an ordered stream of change operations to a document store using
//! the net-effect analysis of [`oplog_engine`]: operations are cut into
//! batches, reduced to one effect per document and executed per namespace,
//! with commands and system-collection writes applied alone as barriers.

pub mod applier;
pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod retry;
mod routes;

pub use applier::{DefaultOperationApplier, OperationApplier};
pub use backend::{Backend, Checkpoint, MemoryBackend, PgBackend};
pub use config::{Config, ConfigError, ExecutorKind};
pub use driver::{json_lines, BatchLimits, OplogApplier, ReplicationStatus, SharedStatus};
pub use error::{ApplyError, BackendError, JobError, ReplError, Result};
pub use executor::{
    AdaptiveSubBatchHeuristic, BatchExecutor, ConcurrentBatchExecutor, FixedSubBatchHeuristic,
    JobOutcome, NamespaceJobExecutor, SequentialBatchExecutor, SubBatchHeuristic,
};
pub use metrics::{ExecutorMetrics, MetricsSnapshot};
pub use retry::RetryPolicy;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub metrics: Arc<ExecutorMetrics>,
    pub status: SharedStatus,
}

/// Build the status router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
