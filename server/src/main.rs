//! Oplog replication service.
//!
//! Reads change operations as JSON lines from stdin, applies them to the
//! configured document store and serves replication status over HTTP.

use oplog_server::{
    build_router, json_lines, AdaptiveSubBatchHeuristic, AppState, Backend, BatchExecutor,
    Config, ConcurrentBatchExecutor, DefaultOperationApplier, ExecutorKind, ExecutorMetrics,
    FixedSubBatchHeuristic, MemoryBackend, OplogApplier, PgBackend, SequentialBatchExecutor,
    SharedStatus, SubBatchHeuristic,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oplog_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let backend: Arc<dyn Backend> = match &config.database_url {
        Some(url) => {
            let pg = PgBackend::connect(url, config.workers as u32 + 1).await?;
            tracing::info!("Running database migrations...");
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryBackend::new())
        }
    };

    let metrics = Arc::new(ExecutorMetrics::new());
    let applier = Arc::new(DefaultOperationApplier);
    let executor: Arc<dyn BatchExecutor> = match config.executor {
        ExecutorKind::Sequential => Arc::new(
            SequentialBatchExecutor::new(Arc::clone(&backend), applier)
                .with_metrics(Arc::clone(&metrics))
                .with_retry_policy(config.retry.clone()),
        ),
        ExecutorKind::Concurrent => {
            let heuristic: Arc<dyn SubBatchHeuristic> = match config.sub_batch_size {
                Some(size) => Arc::new(FixedSubBatchHeuristic(size)),
                None => Arc::new(AdaptiveSubBatchHeuristic::default()),
            };
            Arc::new(
                ConcurrentBatchExecutor::new(Arc::clone(&backend), applier, heuristic, config.workers)
                    .with_metrics(Arc::clone(&metrics))
                    .with_retry_policy(config.retry.clone()),
            )
        }
    };
    tracing::info!(executor = ?config.executor, workers = config.workers, "Executor ready");

    let status = SharedStatus::default();
    let state = AppState {
        backend: Arc::clone(&backend),
        metrics,
        status: Arc::clone(&status),
    };

    // Status server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Status server listening on {}", addr);
    let server = tokio::spawn(async move { axum::serve(listener, build_router(state)).await });

    let driver = OplogApplier::new(backend, executor)
        .with_limits(config.batch_limits)
        .with_status(status);
    let source = json_lines(BufReader::new(tokio::io::stdin()));

    let outcome = tokio::select! {
        result = driver.run(source) => result.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping replication");
            Ok(())
        }
    };

    server.abort();
    outcome?;
    Ok(())
}
