//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: run the scheduler in the foreground
//! - enqueue: submit a task
//! - status: get task status
//! - list: list tasks
//! - queues: show per-queue aggregates

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Workq - A durable task scheduling and queue execution engine
#[derive(Parser, Debug)]
#[command(name = "workq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler in the foreground until Ctrl-C
    Run,

    /// Submit a task to a queue
    Enqueue {
        /// Target queue (portfolio_sync, data_fetcher, ai_analysis)
        queue: String,

        /// Task type (must have a registered handler)
        task_type: String,

        /// JSON object payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Priority (higher runs first)
        #[arg(long)]
        priority: Option<i64>,

        /// Maximum attempts before the task fails terminally
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Per-attempt deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Get status of a specific task
    Status {
        /// Task ID to check
        id: String,
    },

    /// List tasks
    List {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by queue
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Show per-queue aggregates
    Queues,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["workq", "-v", "queues"]).unwrap();
        assert!(cli.is_verbose());
    }

    #[test]
    fn test_cli_config_option() {
        let cli = Cli::try_parse_from(["workq", "-c", "/path/to/workq.yml", "run"]).unwrap();
        assert_eq!(cli.config.as_ref(), Some(&PathBuf::from("/path/to/workq.yml")));
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["workq", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_enqueue_minimal() {
        let cli = Cli::try_parse_from(["workq", "enqueue", "data_fetcher", "fetch_news"]).unwrap();
        match cli.command {
            Commands::Enqueue {
                queue,
                task_type,
                payload,
                priority,
                max_attempts,
                timeout,
            } => {
                assert_eq!(queue, "data_fetcher");
                assert_eq!(task_type, "fetch_news");
                assert!(payload.is_none());
                assert!(priority.is_none());
                assert!(max_attempts.is_none());
                assert!(timeout.is_none());
            }
            _ => panic!("Expected enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_full() {
        let cli = Cli::try_parse_from([
            "workq",
            "enqueue",
            "ai_analysis",
            "analyze_batch",
            "-p",
            r#"{"symbols": ["AAPL"]}"#,
            "--priority",
            "9",
            "--max-attempts",
            "5",
            "--timeout",
            "600",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                queue,
                task_type,
                payload,
                priority,
                max_attempts,
                timeout,
            } => {
                assert_eq!(queue, "ai_analysis");
                assert_eq!(task_type, "analyze_batch");
                assert_eq!(payload, Some(r#"{"symbols": ["AAPL"]}"#.to_string()));
                assert_eq!(priority, Some(9));
                assert_eq!(max_attempts, Some(5));
                assert_eq!(timeout, Some(600));
            }
            _ => panic!("Expected enqueue command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["workq", "status", "task-123"]).unwrap();
        match cli.command {
            Commands::Status { id } => {
                assert_eq!(id, "task-123");
            }
            _ => panic!("Expected status command"),
        }
    }

    #[test]
    fn test_list_command() {
        let cli = Cli::try_parse_from(["workq", "list"]).unwrap();
        match cli.command {
            Commands::List { status, queue } => {
                assert!(status.is_none());
                assert!(queue.is_none());
            }
            _ => panic!("Expected list command"),
        }
    }

    #[test]
    fn test_list_with_filters() {
        let cli = Cli::try_parse_from(["workq", "list", "-s", "failed", "-q", "data_fetcher"]).unwrap();
        match cli.command {
            Commands::List { status, queue } => {
                assert_eq!(status, Some("failed".to_string()));
                assert_eq!(queue, Some("data_fetcher".to_string()));
            }
            _ => panic!("Expected list command"),
        }
    }

    #[test]
    fn test_queues_command() {
        let cli = Cli::try_parse_from(["workq", "queues"]).unwrap();
        assert!(matches!(cli.command, Commands::Queues));
    }

    #[test]
    fn test_missing_subcommand_errors() {
        assert!(Cli::try_parse_from(["workq"]).is_err());
    }

    #[test]
    fn test_help_works() {
        // Verify help doesn't panic
        Cli::command().debug_assert();
    }

    #[test]
    fn test_version_flag() {
        let result = Cli::try_parse_from(["workq", "--version"]);
        // Version flag causes early exit with error (expected)
        assert!(result.is_err());
    }
}
