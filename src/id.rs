//! ID generation utilities for workq
//!
//! Provides functions for generating unique identifiers for tasks and events.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as i64
}

/// Generate a unique task ID
///
/// Format: `task-{timestamp_ms}-{random_hex}`
/// Example: `task-1738300800123-a1b2`
pub fn generate_task_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("task-{}-{:04x}", timestamp, random)
}

/// Generate a unique event ID
///
/// Format: `evt-{timestamp_ms}-{random_hex}`
pub fn generate_event_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("evt-{}-{:04x}", timestamp, random)
}
