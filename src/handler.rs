//! Task handler trait and registry.
//!
//! Handlers implement the domain work (portfolio sync, data fetches, AI
//! analysis); the engine only knows them through the `TaskHandler` trait.
//! The registry maps `(queue, task_type)` to a handler and fails loudly on
//! a miss. A mandatory startup audit cross-checks every referenced task
//! type against the registry so an unregistered type is a startup error,
//! not a task stuck in a failure loop.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{HandlerError, Result, WorkqError};
use crate::store::{QueueName, TaskRecord};

/// The executable side of a task type.
///
/// Handlers classify their own failures as retryable or fatal via
/// `HandlerError`; they never touch task status. Long external calls must
/// propagate the task deadline downstream, since cancellation is
/// cooperative (the runner drops the future at an await point when the
/// deadline elapses).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task, returning an opaque result value on success.
    async fn execute(&self, task: &TaskRecord) -> std::result::Result<Value, HandlerError>;
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TaskHandler")
    }
}

/// Registry mapping (queue, task_type) to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<(QueueName, String), Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a (queue, task_type) pair.
    ///
    /// Re-registering the same pair replaces the previous handler.
    pub fn register(&mut self, queue: QueueName, task_type: &str, handler: Arc<dyn TaskHandler>) {
        tracing::debug!(queue = %queue, task_type = %task_type, "Registered handler");
        self.handlers.insert((queue, task_type.to_string()), handler);
    }

    /// Resolve the handler for a (queue, task_type) pair.
    ///
    /// A miss is a structural configuration defect, surfaced as
    /// `HandlerNotFound` and never retried.
    pub fn resolve(&self, queue: QueueName, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&(queue, task_type.to_string()))
            .cloned()
            .ok_or_else(|| WorkqError::HandlerNotFound {
                queue,
                task_type: task_type.to_string(),
            })
    }

    /// Whether a handler exists for the pair.
    pub fn contains(&self, queue: QueueName, task_type: &str) -> bool {
        self.handlers.contains_key(&(queue, task_type.to_string()))
    }

    /// All registered (queue, task_type) pairs.
    pub fn registered_types(&self) -> Vec<(QueueName, String)> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        types
    }

    /// Startup self-check: assert every referenced task type has a handler.
    ///
    /// Returns `HandlerNotFound` for the first gap so the defect is caught
    /// before first use rather than at claim time.
    pub fn audit(&self, referenced: &[(QueueName, String)]) -> Result<()> {
        for (queue, task_type) in referenced {
            if !self.contains(*queue, task_type) {
                tracing::error!(
                    queue = %queue,
                    task_type = %task_type,
                    "Startup audit: task type referenced but no handler registered"
                );
                return Err(WorkqError::HandlerNotFound {
                    queue: *queue,
                    task_type: task_type.clone(),
                });
            }
        }
        tracing::info!(count = referenced.len(), "Startup audit passed");
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in handler that succeeds immediately, echoing the payload back.
///
/// Registered by the CLI daemon so the engine is exercisable end-to-end
/// without domain handlers.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn execute(&self, task: &TaskRecord) -> std::result::Result<Value, HandlerError> {
        Ok(Value::Object(task.payload.clone()))
    }
}
