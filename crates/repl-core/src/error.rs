//! Error taxonomy for the replication engine.
//!
//! Mirrors the shape of the taxonomy in the design docs: configuration,
//! connection, query, write, scheduler, and orchestrator failures each get
//! their own variant so callers can match on failure class without parsing
//! strings.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("worker process error: {0}")]
    Worker(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid duration string: {0}")]
    InvalidDuration(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid cron expression: {0}")]
    Cron(String),

    #[error("{0}")]
    Other(String),
}

impl ReplicatorError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ReplicatorError::Config(msg.into())
    }

    pub fn connection<T: Into<String>>(msg: T) -> Self {
        ReplicatorError::Connection(msg.into())
    }

    pub fn query<T: Into<String>>(msg: T) -> Self {
        ReplicatorError::Query(msg.into())
    }

    pub fn write<T: Into<String>>(msg: T) -> Self {
        ReplicatorError::Write(msg.into())
    }

    /// Whether this error class should be retried by the transport envelope.
    /// Only transport-level failures (I/O, timeout, 5xx) are retryable;
    /// dialect-level errors (4xx, malformed JSON) surface immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicatorError::Connection(_) => true,
            ReplicatorError::Http(e) => {
                e.is_timeout() || e.is_connect() || matches!(e.status().map(|s| s.as_u16()), Some(code) if code >= 500)
            }
            ReplicatorError::Cancelled => false,
            _ => false,
        }
    }

    /// Error category for structured log fields and summary reporting.
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Config(_) => "config",
            ReplicatorError::Connection(_) => "connection",
            ReplicatorError::Query(_) => "query",
            ReplicatorError::Write(_) => "write",
            ReplicatorError::Scheduler(_) => "scheduler",
            ReplicatorError::Worker(_) => "worker",
            ReplicatorError::Cancelled => "cancelled",
            ReplicatorError::InvalidDuration(_) => "config",
            ReplicatorError::InvalidIdentifier(_) => "config",
            ReplicatorError::Http(_) => "connection",
            ReplicatorError::Yaml(_) => "config",
            ReplicatorError::Io(_) => "io",
            ReplicatorError::Cron(_) => "scheduler",
            ReplicatorError::Other(_) => "other",
        }
    }
}
