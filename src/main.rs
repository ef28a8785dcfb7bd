use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use workq::cli::Cli;
use workq::cli::commands::Commands;
use workq::config::Config;
use workq::handler::{HandlerRegistry, NoopHandler};
use workq::scheduler::Scheduler;
use workq::store::{Payload, QueueName, TaskRecord, TaskStatus, TaskStore};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workq")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("workq.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_store(config: &Config) -> Result<TaskStore> {
    TaskStore::open(&config.storage.project_dir).context("Failed to open task store")
}

/// Built-in handlers so the engine is runnable out of the box; domain
/// handlers register alongside these when workq is embedded as a library.
fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for queue in QueueName::all() {
        registry.register(queue, "noop", Arc::new(NoopHandler));
    }
    registry
}

async fn run_scheduler(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let mut scheduler = Scheduler::new(store, builtin_registry(), config.scheduler_config());

    scheduler.start().await.context("Failed to start scheduler")?;
    println!("{}", "Scheduler running, Ctrl-C to stop".cyan());

    // Mirror lifecycle events to the console while we wait
    let mut events = scheduler.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "{} {} [{}] {}",
                event.event_type.cyan(),
                event.task_id,
                event.queue,
                event.status
            );
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("{}", "Shutting down...".yellow());

    let cancelled = scheduler.shutdown().await.context("Shutdown failed")?;
    printer.abort();

    if !cancelled.is_empty() {
        println!("{} {} task(s) cancelled", "Warning:".yellow(), cancelled.len());
    }
    println!("{}", "Stopped".green());
    Ok(())
}

fn parse_payload(raw: Option<&str>) -> Result<Payload> {
    match raw {
        None => Ok(Payload::new()),
        Some(text) => {
            let value: serde_json::Value =
                serde_json::from_str(text).context("Payload is not valid JSON")?;
            match value {
                serde_json::Value::Object(map) => Ok(map),
                _ => bail!("Payload must be a JSON object"),
            }
        }
    }
}

fn handle_enqueue(
    config: &Config,
    queue: &str,
    task_type: &str,
    payload: Option<&str>,
    priority: Option<i64>,
    max_attempts: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    let queue = QueueName::from_str(queue)?;
    let payload = parse_payload(payload)?;
    let priority = priority.unwrap_or(config.defaults.priority);
    let max_attempts = max_attempts.unwrap_or(config.defaults.max_attempts);
    let timeout = timeout.unwrap_or_else(|| config.timeouts.for_type(task_type));

    let mut store = open_store(config)?;
    let task = store.enqueue(queue, task_type, payload, priority, max_attempts, timeout)?;

    info!("Enqueued task {} on {}", task.id, task.queue);
    println!("{} {}", "Enqueued:".green(), task.id);
    Ok(())
}

fn handle_status(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    match store.get(id)? {
        Some(task) => print_task(&task),
        None => println!("{} {}", "Not found:".red(), id),
    }
    Ok(())
}

fn handle_list(config: &Config, status: Option<&str>, queue: Option<&str>) -> Result<()> {
    let store = open_store(config)?;

    let mut tasks = match (status, queue) {
        (Some(s), _) => store.list_by_status(TaskStatus::from_str(s)?)?,
        (None, Some(q)) => store.list_by_queue(QueueName::from_str(q)?)?,
        (None, None) => store.list_all()?,
    };
    if let (Some(_), Some(q)) = (status, queue) {
        let queue = QueueName::from_str(q)?;
        tasks.retain(|t| t.queue == queue);
    }

    if tasks.is_empty() {
        println!("{}", "No tasks".yellow());
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{}  {}  {}/{}  attempts {}/{}",
            task.id,
            colorize_status(task.status),
            task.queue,
            task.task_type,
            task.attempt_count,
            task.max_attempts
        );
    }
    Ok(())
}

fn handle_queues(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let states = store.aggregate_all()?;

    for queue in QueueName::all() {
        if let Some(state) = states.get(&queue) {
            println!(
                "{}: {} pending, {} running, {} completed today, {} failed today",
                queue.to_string().cyan(),
                state.pending,
                state.running,
                state.completed_today,
                state.failed_today
            );
            if let Some(task_id) = &state.running_task {
                println!("  running: {}", task_id);
            }
        }
    }
    Ok(())
}

fn print_task(task: &TaskRecord) {
    println!("{} {}", "Task:".green(), task.id);
    println!("  queue:     {}", task.queue);
    println!("  type:      {}", task.task_type);
    println!("  status:    {}", colorize_status(task.status));
    println!("  priority:  {}", task.priority);
    println!("  attempts:  {}/{}", task.attempt_count, task.max_attempts);
    if let Some(error) = &task.error {
        println!("  error:     {}", error.red());
    }
    if let Some(result) = &task.result {
        println!("  result:    {}", result);
    }
}

fn colorize_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.to_string().yellow(),
        TaskStatus::Running => status.to_string().cyan(),
        TaskStatus::Completed => status.to_string().green(),
        TaskStatus::Failed => status.to_string().red(),
        TaskStatus::Cancelled => status.to_string().magenta(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run => run_scheduler(&config).await,
        Commands::Enqueue {
            queue,
            task_type,
            payload,
            priority,
            max_attempts,
            timeout,
        } => handle_enqueue(
            &config,
            queue,
            task_type,
            payload.as_deref(),
            *priority,
            *max_attempts,
            *timeout,
        ),
        Commands::Status { id } => handle_status(&config, id),
        Commands::List { status, queue } => {
            handle_list(&config, status.as_deref(), queue.as_deref())
        }
        Commands::Queues => handle_queues(&config),
    }
}
