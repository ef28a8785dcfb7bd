//! CLI module for workq - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running the engine,
//! submitting tasks, and inspecting task and queue state.

pub mod commands;

pub use commands::Cli;
