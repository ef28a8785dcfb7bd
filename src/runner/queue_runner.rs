//! Queue runner implementation - sequential task execution for one queue.
//!
//! Each queue gets exactly one runner, so at most one task per queue is
//! RUNNING at any instant. Parallelism exists across queues, never within
//! one. The runner claims the next eligible task, resolves its handler,
//! executes it under the task's deadline, and maps the outcome onto the
//! status state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::timeout;

use crate::backoff::BackoffPolicy;
use crate::error::{HandlerError, Result, WorkqError};
use crate::events::{EventEmitter, TaskEvent};
use crate::handler::HandlerRegistry;
use crate::store::{QueueName, TaskRecord, TaskStore};

/// Outcome of a single task execution, after status has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler succeeded, task is COMPLETED
    Completed,
    /// Retryable failure with attempts remaining, task re-queued
    RetryScheduled { delay_ms: u64 },
    /// Non-retryable failure or attempts exhausted, task is FAILED
    Failed(String),
}

/// QueueRunner executes tasks for a single queue, one at a time.
///
/// The store mutex is held only for the short synchronous store calls,
/// never across handler execution, so runners for other queues proceed
/// while this one waits on a handler.
pub struct QueueRunner {
    /// Queue this runner owns
    queue: QueueName,
    /// Shared task store
    store: Arc<Mutex<TaskStore>>,
    /// Handler lookup
    registry: Arc<HandlerRegistry>,
    /// Retry delay policy
    backoff: BackoffPolicy,
    /// Lifecycle event sink
    emitter: EventEmitter,
    /// Poll interval when the queue is empty
    idle_interval: Duration,
    /// Shutdown signal from the scheduler
    shutdown: watch::Receiver<bool>,
}

impl QueueRunner {
    pub fn new(
        queue: QueueName,
        store: Arc<Mutex<TaskStore>>,
        registry: Arc<HandlerRegistry>,
        backoff: BackoffPolicy,
        emitter: EventEmitter,
        idle_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            backoff,
            emitter,
            idle_interval,
            shutdown,
        }
    }

    /// Run until shutdown is signalled.
    ///
    /// Drains eligible tasks back-to-back; sleeps `idle_interval` when the
    /// queue is empty. A task already executing when shutdown arrives is
    /// allowed to finish (the scheduler enforces the grace period).
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(queue = %self.queue, "Queue runner started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(queue = %self.queue, ?outcome, "Task processed");
                }
                Ok(None) => {
                    // Queue empty: wait for the poll interval or shutdown,
                    // whichever comes first
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_interval) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    // Store-level failure; back off briefly rather than
                    // spinning on a broken database
                    tracing::error!(queue = %self.queue, error = %e, "Runner iteration failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_interval) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue, "Queue runner stopped");
        Ok(())
    }

    /// Claim and execute at most one task.
    ///
    /// Returns `None` when no task is eligible.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>> {
        let claimed = {
            let mut store = self.store.lock().await;
            store.claim_next(self.queue)?
        };

        let task = match claimed {
            Some(task) => task,
            None => return Ok(None),
        };

        self.emitter.emit(TaskEvent::started(&task));
        tracing::info!(
            queue = %self.queue,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt_count,
            "Executing task"
        );

        let outcome = self.execute(&task).await?;
        Ok(Some(outcome))
    }

    /// Execute a claimed task and persist the resulting transition.
    async fn execute(&self, task: &TaskRecord) -> Result<TaskOutcome> {
        let handler = match self.registry.resolve(task.queue, &task.task_type) {
            Ok(handler) => handler,
            Err(e @ WorkqError::HandlerNotFound { .. }) => {
                // Structural defect, never retried
                return self.mark_failed(task, &e.to_string()).await;
            }
            Err(e) => return Err(e),
        };

        let deadline = Duration::from_secs(task.timeout_seconds);
        let result = match timeout(deadline, handler.execute(task)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(task.timeout_seconds)),
        };

        match result {
            Ok(value) => {
                let completed = {
                    let mut store = self.store.lock().await;
                    store.complete(&task.id, value)?
                };
                self.emitter.emit(TaskEvent::completed(&completed));
                Ok(TaskOutcome::Completed)
            }
            Err(handler_err) => self.handle_failure(task, handler_err).await,
        }
    }

    /// Map a handler failure onto retry-or-fail.
    async fn handle_failure(
        &self,
        task: &TaskRecord,
        handler_err: HandlerError,
    ) -> Result<TaskOutcome> {
        let error_text = handler_err.to_string();

        if handler_err.is_retryable() && task.attempts_remaining() {
            let delay = self.backoff.delay(task.attempt_count);
            let retried = {
                let mut store = self.store.lock().await;
                store.retry(&task.id, &error_text, delay)?
            };
            let delay_ms = delay.as_millis() as u64;
            tracing::warn!(
                queue = %self.queue,
                task_id = %task.id,
                attempt = task.attempt_count,
                delay_ms,
                error = %error_text,
                "Task failed, retry scheduled"
            );
            self.emitter.emit(TaskEvent::retry_scheduled(&retried, delay_ms));
            Ok(TaskOutcome::RetryScheduled { delay_ms })
        } else {
            self.mark_failed(task, &error_text).await
        }
    }

    /// Persist a terminal FAILED transition.
    async fn mark_failed(&self, task: &TaskRecord, error_text: &str) -> Result<TaskOutcome> {
        let failed = {
            let mut store = self.store.lock().await;
            store.fail(&task.id, error_text)?
        };
        tracing::error!(
            queue = %self.queue,
            task_id = %task.id,
            attempt = task.attempt_count,
            error = %error_text,
            "Task failed terminally"
        );
        self.emitter.emit(TaskEvent::failed(&failed));
        Ok(TaskOutcome::Failed(error_text.to_string()))
    }
}
