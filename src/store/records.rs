//! Task record types for TaskStore persistence.
//!
//! This module defines the `TaskRecord` stored for every unit of background
//! work, the `TaskStatus` state machine, the fixed set of queue names, and
//! the derived `QueueState` aggregate. Payloads cross the storage boundary
//! through a single canonical serialization point with permissive decoding:
//! a malformed legacy encoding decodes to an empty map instead of crashing
//! the runner.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::WorkqError;
use crate::id::{generate_task_id, now_ms};

/// Opaque structured payload carried by a task.
pub type Payload = serde_json::Map<String, Value>;

/// The fixed set of named queues. Each queue is an independently scheduled
/// lane with its own sequential-execution guarantee.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    PortfolioSync,
    DataFetcher,
    AiAnalysis,
}

impl QueueName {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::PortfolioSync => "portfolio_sync",
            QueueName::DataFetcher => "data_fetcher",
            QueueName::AiAnalysis => "ai_analysis",
        }
    }

    /// All known queues, in scheduling order.
    pub fn all() -> [QueueName; 3] {
        [
            QueueName::PortfolioSync,
            QueueName::DataFetcher,
            QueueName::AiAnalysis,
        ]
    }
}

impl FromStr for QueueName {
    type Err = WorkqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portfolio_sync" => Ok(QueueName::PortfolioSync),
            "data_fetcher" => Ok(QueueName::DataFetcher),
            "ai_analysis" => Ok(QueueName::AiAnalysis),
            other => Err(WorkqError::UnknownQueue(other.to_string())),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for its `scheduled_at` to pass
    Pending,
    /// Claimed by the owning queue runner
    Running,
    /// Terminal success
    Completed,
    /// Terminal: attempts exhausted or non-retryable error
    Failed,
    /// Terminal: process shut down while running
    Cancelled,
}

impl TaskStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check whether the state machine permits this transition.
    ///
    /// Valid edges: pending -> running (claim), running -> completed,
    /// running -> failed, running -> pending (retry), running -> cancelled
    /// (shutdown). Anything else is a defect to be rejected, not coerced.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Pending)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = WorkqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(WorkqError::Storage(format!("unknown status: {}", other))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    /// Unique ID: "task-{ms}-{hex}"
    pub id: String,

    /// Owning queue, immutable after creation
    pub queue: QueueName,

    /// Handler discriminator, immutable after creation
    pub task_type: String,

    /// Opaque structured arguments. Round-trips exactly; malformed legacy
    /// encodings decode to an empty map.
    #[serde(default, deserialize_with = "permissive_payload")]
    pub payload: Payload,

    /// Higher runs first within the queue; ties broken FIFO by created_at
    pub priority: i64,

    /// Current status
    pub status: TaskStatus,

    /// Attempts consumed so far; incremented on claim, never exceeds max
    pub attempt_count: u32,

    /// Limit before terminal failure
    pub max_attempts: u32,

    /// Earliest time eligible to run (Unix ms); backoff pushes it forward
    pub scheduled_at: i64,

    /// Set on first claim, never mutated afterward
    pub started_at: Option<i64>,

    /// Set once on reaching a terminal status
    pub completed_at: Option<i64>,

    /// Per-task execution deadline
    pub timeout_seconds: u64,

    /// Last failure summary; cleared on success
    pub error: Option<String>,

    /// Opaque output on success, None otherwise
    pub result: Option<Value>,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

impl TaskRecord {
    /// Create a new pending task.
    pub fn new(
        queue: QueueName,
        task_type: &str,
        payload: Payload,
        priority: i64,
        max_attempts: u32,
        timeout_seconds: u64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_task_id(),
            queue,
            task_type: task_type.to_string(),
            payload,
            priority,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            timeout_seconds,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Whether another retry attempt is permitted.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Derived, read-only aggregate over the task records of one queue.
///
/// Never stored independently; always computed from the TaskStore so there
/// is exactly one source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueState {
    pub queue: QueueName,
    pub pending: u64,
    pub running: u64,
    pub completed_today: u64,
    pub failed_today: u64,
    /// Average wall-clock duration of completed tasks, if any completed
    pub avg_duration_ms: Option<f64>,
    /// Currently running task, if any
    pub running_task: Option<String>,
}

impl QueueState {
    /// Empty state for a queue with no tasks.
    pub fn empty(queue: QueueName) -> Self {
        Self {
            queue,
            pending: 0,
            running: 0,
            completed_today: 0,
            failed_today: 0,
            avg_duration_ms: None,
            running_task: None,
        }
    }
}

/// Serialize a payload for storage. Single canonical boundary: always JSON.
pub fn encode_payload(payload: &Payload) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
}

/// Decode a stored payload string.
///
/// Permissive by contract: anything that is not a JSON object (including
/// the source system's legacy `str(dict)` encodings) decodes to an empty
/// map rather than raising.
pub fn decode_payload(raw: &str) -> Payload {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!(kind = %value_kind(&other), "Payload is not a JSON object, using empty map");
            Payload::new()
        }
        Err(_) => {
            tracing::warn!("Malformed payload encoding, using empty map");
            Payload::new()
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Permissive serde deserializer for the payload field: objects pass
/// through, strings are decoded via `decode_payload`, anything else becomes
/// an empty map.
fn permissive_payload<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Object(map)) => map,
        Some(Value::String(raw)) => decode_payload(&raw),
        _ => Payload::new(),
    })
}
