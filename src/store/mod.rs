//! Task persistence: records, state machine, and the durable TaskStore.
//!
//! The store is the single source of truth for task lifecycle state. Queue
//! aggregates are always derived from it, never stored independently.

pub mod records;
pub mod task_store;

pub use records::{
    Payload, QueueName, QueueState, TaskRecord, TaskStatus, decode_payload, encode_payload,
};
pub use task_store::{TaskStore, compute_project_hash};
