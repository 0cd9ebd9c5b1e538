//! Error types for the stream relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Fragment cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("No such job: {key}")]
    UnknownJob { key: String },

    #[error("Job {key} already has an active stream")]
    AlreadyActive { key: String },

    #[error("Job {key} stream is sealed")]
    Sealed { key: String },

    #[error("Invalid job key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Stream for job {key} was lost before completion")]
    StreamLost { key: String },

    #[error("Log IO error for job {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Task supervisor and descriptor errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Job {key} is already running")]
    AlreadyRunning { key: String },

    #[error("Job {key} not found")]
    NotFound { key: String },

    #[error("Job {key} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        key: String,
        state: String,
        target: String,
    },

    #[error("Descriptor error for job {key}: {reason}")]
    Descriptor { key: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("History hand-off failed: {0}")]
    History(#[from] DatabaseError),
}

/// Errors raised by a job's executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("Upstream request failed: {0}")]
    Request(String),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream stream broke: {0}")]
    Stream(String),

    #[error("{0}")]
    Failed(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Job exceeded its deadline of {0:?}")]
    TimedOut(Duration),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
