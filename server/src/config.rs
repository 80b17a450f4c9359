//! Configuration management for the service.

use crate::driver::BatchLimits;
use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which batch executor applies the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Sequential,
    Concurrent,
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(ConfigError::InvalidExecutor(other.to_string())),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Status server host address
    pub host: String,
    /// Status server port
    pub port: u16,
    /// PostgreSQL connection URL; the in-memory store is used without one
    pub database_url: Option<String>,
    pub executor: ExecutorKind,
    /// Concurrent executor worker count
    pub workers: usize,
    /// Fixed sub-batch size; adaptive sizing when unset
    pub sub_batch_size: Option<usize>,
    pub batch_limits: BatchLimits,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());

        let executor = match lookup("REPL_EXECUTOR") {
            Some(value) => value.parse()?,
            None => ExecutorKind::Concurrent,
        };

        let workers = parse_or(&lookup, "REPL_WORKERS", 4)?;
        let sub_batch_size = lookup("REPL_SUB_BATCH_SIZE")
            .map(|value| parse_positive("REPL_SUB_BATCH_SIZE", &value))
            .transpose()?;

        let defaults = BatchLimits::default();
        let batch_limits = BatchLimits {
            max_size: parse_or(&lookup, "REPL_BATCH_MAX_SIZE", defaults.max_size)?,
            max_period: Duration::from_millis(parse_or(
                &lookup,
                "REPL_BATCH_MAX_PERIOD_MS",
                defaults.max_period.as_millis() as usize,
            )? as u64),
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "REPL_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            initial_delay: Duration::from_millis(parse_or(
                &lookup,
                "REPL_RETRY_INITIAL_DELAY_MS",
                retry_defaults.initial_delay.as_millis() as usize,
            )? as u64),
            ..retry_defaults
        };

        Ok(Self {
            host,
            port,
            database_url,
            executor,
            workers,
            sub_batch_size,
            batch_limits,
            retry,
        })
    }
}

fn parse_or<F>(lookup: &F, name: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => parse_positive(name, &value),
        None => Ok(default),
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid REPL_EXECUTOR value '{0}', expected 'concurrent' or 'sequential'")]
    InvalidExecutor(String),

    #[error("Invalid {name} value '{value}', expected a positive integer")]
    InvalidNumber { name: &'static str, value: String },
}
