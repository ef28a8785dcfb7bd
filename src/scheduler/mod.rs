//! Top-level scheduler - owns the runners and the external API.
//!
//! The scheduler wires the store, registry, and event emitter together,
//! spawns one QueueRunner per queue, and is the single entry point the
//! outer layers (CLI, web) use to submit and observe tasks. Shutdown is
//! graceful: runners get a grace period to finish the task in flight,
//! after which anything still RUNNING is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::events::{EventEmitter, TaskEvent};
use crate::handler::HandlerRegistry;
use crate::runner::QueueRunner;
use crate::store::{Payload, QueueName, QueueState, TaskRecord, TaskStore};

/// Runtime knobs for the scheduler and its runners.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll interval for runners when their queue is empty
    pub idle_interval: Duration,
    /// How long shutdown waits for in-flight tasks before cancelling
    pub grace_period: Duration,
    /// Retry delay policy shared by all runners
    pub backoff: BackoffPolicy,
    /// Broadcast channel capacity for the event stream
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            event_capacity: 256,
        }
    }
}

/// Scheduler owns the per-queue runners and the submission/read API.
pub struct Scheduler {
    store: Arc<Mutex<TaskStore>>,
    registry: Arc<HandlerRegistry>,
    emitter: EventEmitter,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Scheduler {
    /// Create a scheduler over an opened store and a populated registry.
    pub fn new(store: TaskStore, registry: HandlerRegistry, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let emitter = EventEmitter::new(config.event_capacity);
        Self {
            store: Arc::new(Mutex::new(store)),
            registry: Arc::new(registry),
            emitter,
            config,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Startup self-check: every task type referenced by a live task must
    /// have a registered handler.
    pub async fn audit(&self) -> Result<()> {
        let referenced = {
            let store = self.store.lock().await;
            store.referenced_task_types()?
        };
        self.registry.audit(&referenced)
    }

    /// Audit, then spawn one runner per queue.
    pub async fn start(&mut self) -> Result<()> {
        self.audit().await?;

        for queue in QueueName::all() {
            let mut runner = QueueRunner::new(
                queue,
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.config.backoff.clone(),
                self.emitter.clone(),
                self.config.idle_interval,
                self.shutdown_tx.subscribe(),
            );
            self.handles.push(tokio::spawn(async move { runner.run().await }));
        }

        tracing::info!(runners = self.handles.len(), "Scheduler started");
        Ok(())
    }

    /// Submit a task. Returns after the record is durably persisted.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        task_type: &str,
        payload: Payload,
        priority: i64,
        max_attempts: u32,
        timeout_seconds: u64,
    ) -> Result<TaskRecord> {
        let task = {
            let mut store = self.store.lock().await;
            store.enqueue(queue, task_type, payload, priority, max_attempts, timeout_seconds)?
        };
        self.emitter.emit(TaskEvent::enqueued(&task));
        Ok(task)
    }

    /// Look up a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let store = self.store.lock().await;
        store.get(task_id)
    }

    /// Derived aggregate for one queue.
    pub async fn queue_state(&self, queue: QueueName) -> Result<QueueState> {
        let store = self.store.lock().await;
        store.aggregate(queue)
    }

    /// Derived aggregates for every queue, in declaration order.
    pub async fn all_queue_states(&self) -> Result<Vec<QueueState>> {
        let store = self.store.lock().await;
        let mut states = store.aggregate_all()?;
        Ok(QueueName::all()
            .into_iter()
            .filter_map(|q| states.remove(&q))
            .collect())
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.emitter.subscribe()
    }

    /// Signal shutdown, wait out the grace period, cancel stragglers.
    ///
    /// Returns the tasks that were still RUNNING and had to be cancelled.
    pub async fn shutdown(mut self) -> Result<Vec<TaskRecord>> {
        tracing::info!("Scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(
            self.config.grace_period,
            futures::future::join_all(handles),
        )
        .await;

        if drained.is_err() {
            tracing::warn!(
                grace_ms = self.config.grace_period.as_millis() as u64,
                "Grace period elapsed, aborting runners"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let cancelled = {
            let mut store = self.store.lock().await;
            store.cancel_running()?
        };
        for task in &cancelled {
            self.emitter.emit(TaskEvent::cancelled(task));
        }

        tracing::info!(cancelled = cancelled.len(), "Scheduler stopped");
        Ok(cancelled)
    }
}
