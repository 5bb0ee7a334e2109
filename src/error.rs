//! Error types for the offchain runtime.

use std::time::Duration;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Configuration-related errors.
///
/// `NoCapability` and `DuplicateJob` are programming defects in the job set
/// handed to the runtime; they abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Job {job} implements no activation capability")]
    NoCapability { job: String },

    #[error("Job id {job} is registered more than once")]
    DuplicateJob { job: String },
}

/// Errors crossing the chain-access boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Block {number} not found")]
    BlockNotFound { number: u64 },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Chain client closed")]
    Closed,
}

/// Errors produced while activating or executing a job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("Job {job} failed: {reason}")]
    Failed { job: String, reason: String },

    #[error("Job {job} timed out after {timeout:?}")]
    Timeout { job: String, timeout: Duration },

    #[error("Job {job} cancelled")]
    Cancelled { job: String },

    #[error("Job {job} panicked: {message}")]
    Panicked { job: String, message: String },

    #[error("Job {job} was queued when the worker pool stopped")]
    Rejected { job: String },

    #[error("Job {job} failed to subscribe: {source}")]
    Subscribe {
        job: String,
        #[source]
        source: ChainError,
    },
}

impl JobError {
    /// Shorthand for a plain execution failure.
    pub fn failed(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            job: job.into(),
            reason: reason.into(),
        }
    }
}

/// Worker pool lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is stopped")]
    Stopped,

    #[error("Worker pool has not been started")]
    NotStarted,

    #[error("Worker pool is already running")]
    AlreadyStarted,
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
