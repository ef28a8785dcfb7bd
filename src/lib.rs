//! Workq - A durable task scheduling and queue execution engine
//!
//! Tasks are persisted records flowing through a strict status state
//! machine, executed by one sequential runner per queue, with exponential
//! backoff on retryable failures and a broadcast stream of lifecycle
//! events for external observers.

pub mod backoff;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod id;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use error::{Result, WorkqError};
