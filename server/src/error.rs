//! Error types for the replication service.
//!
//! Errors are layered the way they propagate: the storage backend raises
//! [`BackendError`], a namespace job wraps it into [`JobError`] alongside
//! validation mismatches, the single-operation applier raises
//! [`ApplyError`], and batch executors and the driver surface [`ReplError`].

use oplog_engine::{Mismatch, Namespace};

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A document with the same `_id` already exists in the namespace.
    #[error("Duplicate document key: {0}")]
    UniqueViolation(String),

    /// The transaction conflicted with another one and was rolled back.
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    /// The transaction was used after commit.
    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Corrupt stored document: {0}")]
    Corrupt(String),
}

impl BackendError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, BackendError::UniqueViolation(_))
    }

    /// Only conflicts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Rollback(_))
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some("23505") => return BackendError::UniqueViolation(db.message().to_string()),
                Some("40001") | Some("40P01") => {
                    return BackendError::Rollback(db.message().to_string())
                }
                _ => {}
            }
        }
        BackendError::Database(err)
    }
}

/// Failure of one namespace job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Documents that had to exist were not found. No document of the job
    /// was written.
    #[error("{namespace}: {} document(s) expected but not found", .mismatches.len())]
    Mismatch {
        namespace: Namespace,
        mismatches: Vec<Mismatch>,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Engine error: {0}")]
    Engine(#[from] oplog_engine::Error),
}

impl JobError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, JobError::Backend(e) if e.is_unique_violation())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Backend(e) if e.is_retryable())
    }
}

/// Failure of the single-operation applier.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Unsupported command: {0}")]
    UnknownCommand(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Engine error: {0}")]
    Engine(#[from] oplog_engine::Error),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyError::Job(e) => e.is_retryable(),
            ApplyError::Backend(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Replication errors surfaced to the driver.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("Job failed: {0}")]
    Job(#[from] JobError),

    #[error("Apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Engine error: {0}")]
    Engine(#[from] oplog_engine::Error),

    /// A unique violation survived the pessimistic path.
    #[error("Duplicate key in {namespace} without optimistic insert: {source}")]
    InvariantViolation {
        namespace: Namespace,
        #[source]
        source: JobError,
    },

    #[error("Batch {batch_id} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        batch_id: String,
        attempts: usize,
        #[source]
        source: Box<ReplError>,
    },

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Invalid change operation: {0}")]
    Source(String),
}

impl ReplError {
    /// Whether the whole batch may be retried under a reapplying context.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Job(e) => e.is_retryable(),
            ReplError::Apply(e) => e.is_retryable(),
            ReplError::Backend(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for replication.
pub type Result<T> = std::result::Result<T, ReplError>;
