//! Per-queue task execution.

pub mod queue_runner;

pub use queue_runner::{QueueRunner, TaskOutcome};
