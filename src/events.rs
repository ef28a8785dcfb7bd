//! Lifecycle event records and the broadcast emitter.
//!
//! Every task lifecycle transition is turned into a discrete `TaskEvent`
//! with a stable schema, published on a broadcast channel for external
//! consumers (dashboard, logging) instead of ad-hoc callbacks scattered
//! through the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::id::{generate_event_id, now_ms};
use crate::store::{QueueName, TaskRecord, TaskStatus};

/// Event type constants
pub mod event_types {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
}

/// One lifecycle transition, as seen by external consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    /// Unique event identifier
    pub id: String,
    /// Event type (e.g. "task.completed")
    pub event_type: String,
    /// Task this event concerns
    pub task_id: String,
    /// Owning queue
    pub queue: QueueName,
    /// Task status after the transition
    pub status: TaskStatus,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Event-specific detail payload
    pub detail: Value,
}

impl TaskEvent {
    /// Create a new event for a task with the given type and detail.
    pub fn new(event_type: &str, task: &TaskRecord, detail: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type: event_type.to_string(),
            task_id: task.id.clone(),
            queue: task.queue,
            status: task.status,
            timestamp: now_ms(),
            detail,
        }
    }

    /// Create a task.enqueued event
    pub fn enqueued(task: &TaskRecord) -> Self {
        Self::new(
            event_types::TASK_ENQUEUED,
            task,
            serde_json::json!({
                "task_type": task.task_type,
                "priority": task.priority,
            }),
        )
    }

    /// Create a task.started event
    pub fn started(task: &TaskRecord) -> Self {
        Self::new(
            event_types::TASK_STARTED,
            task,
            serde_json::json!({ "attempt": task.attempt_count }),
        )
    }

    /// Create a task.completed event
    pub fn completed(task: &TaskRecord) -> Self {
        Self::new(event_types::TASK_COMPLETED, task, Value::Null)
    }

    /// Create a task.retry_scheduled event with the computed delay
    pub fn retry_scheduled(task: &TaskRecord, delay_ms: u64) -> Self {
        Self::new(
            event_types::TASK_RETRY_SCHEDULED,
            task,
            serde_json::json!({
                "attempt": task.attempt_count,
                "delay_ms": delay_ms,
                "error": task.error,
            }),
        )
    }

    /// Create a task.failed event
    pub fn failed(task: &TaskRecord) -> Self {
        Self::new(
            event_types::TASK_FAILED,
            task,
            serde_json::json!({ "error": task.error }),
        )
    }

    /// Create a task.cancelled event
    pub fn cancelled(task: &TaskRecord) -> Self {
        Self::new(event_types::TASK_CANCELLED, task, Value::Null)
    }

    /// Whether this event marks the end of a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Broadcast emitter for lifecycle events.
///
/// Events are published to every subscriber and mirrored into structured
/// logs. Publishing never fails: with no subscribers the event is simply
/// not delivered anywhere but the log.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventEmitter {
    /// Create an emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event.
    pub fn emit(&self, event: TaskEvent) {
        tracing::info!(
            event_type = %event.event_type,
            task_id = %event.task_id,
            queue = %event.queue,
            status = %event.status,
            "Task event"
        );
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
