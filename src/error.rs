//! Error types for workq
//!
//! Centralized error handling using thiserror. `WorkqError` covers the
//! engine itself; `HandlerError` is the taxonomy handlers use to report
//! failures, and the QueueRunner decides retry-vs-terminal from it.

use thiserror::Error;

use crate::store::QueueName;

/// All error types that can occur in workq
#[derive(Debug, Error)]
pub enum WorkqError {
    /// Task not found in storage
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Malformed enqueue input, rejected before anything is persisted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A task type exists but no handler is registered for it.
    /// Configuration defect: the task fails immediately and the startup
    /// audit reports the gap before first use.
    #[error("No handler registered for {queue}/{task_type}")]
    HandlerNotFound { queue: QueueName, task_type: String },

    /// Attempted status transition not permitted by the state machine
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown queue name
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for workq operations
pub type Result<T> = std::result::Result<T, WorkqError>;

/// Failure taxonomy returned by task handlers.
///
/// The QueueRunner is the sole place that maps these onto task status:
/// retryable errors requeue with backoff while attempts remain, fatal
/// errors terminate the task immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Deadline exceeded (retryable)
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// Rate limit, network failure, flaky downstream (retryable)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Handler logic rejects the input (non-retryable)
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Whether the runner may retry the task after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Timeout(_) | HandlerError::Transient(_))
    }
}
