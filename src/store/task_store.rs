//! TaskStore implementation with JSONL append log and SQLite index.
//!
//! The TaskStore provides persistence for task records using a dual-storage
//! approach:
//! - **JSONL file**: Append-only log of all record changes (source of truth)
//! - **SQLite database**: Query index for fast lookups and atomic claims
//!   (rebuilt from JSONL on startup)
//!
//! All mutation goes through this store's atomic operations. `claim_next`
//! selects and transitions a task in one SQLite transaction, which is the
//! concurrency-safety anchor for the whole engine: two runners (or a
//! crash-recovery pass) can never double-claim the same task.

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkqError};
use crate::id::now_ms;
use crate::store::records::{
    Payload, QueueName, QueueState, TaskRecord, TaskStatus, decode_payload, encode_payload,
};

const SELECT_COLUMNS: &str = "id, queue, task_type, payload, priority, status, \
     attempt_count, max_attempts, scheduled_at, started_at, completed_at, \
     timeout_seconds, error, result, created_at, updated_at";

/// TaskStore manages task records with JSONL persistence and SQLite indexing.
pub struct TaskStore {
    /// Base directory for this store
    base_dir: PathBuf,

    /// Path to the JSONL file
    jsonl_path: PathBuf,

    /// SQLite connection for queries and atomic claims
    db: Connection,
}

impl TaskStore {
    /// Open or create a TaskStore for the given project directory.
    ///
    /// The store is created at `~/.workq/<project-hash>/.taskstore/`.
    pub fn open(project_dir: &Path) -> Result<Self> {
        let project_hash = compute_project_hash(project_dir)?;
        let workq_dir = dirs::home_dir()
            .ok_or_else(|| WorkqError::Storage("Cannot determine home directory".to_string()))?
            .join(".workq")
            .join(&project_hash);

        Self::open_at(&workq_dir)
    }

    /// Open or create a TaskStore at the specified directory.
    ///
    /// Useful for testing with custom paths.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        let store_dir = base_dir.join(".taskstore");
        fs::create_dir_all(&store_dir)?;

        let jsonl_path = store_dir.join("tasks.jsonl");
        let db_path = store_dir.join("taskstore.db");

        let db = Connection::open(&db_path)?;
        Self::init_schema(&db)?;

        let mut store = Self {
            base_dir: base_dir.to_path_buf(),
            jsonl_path,
            db,
        };

        store.rebuild_index_if_needed()?;
        store.recover_interrupted()?;

        Ok(store)
    }

    /// Initialize the SQLite schema.
    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                scheduled_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                timeout_seconds INTEGER NOT NULL,
                error TEXT,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_claim
                ON tasks(queue, status, scheduled_at, priority);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
            "#,
        )?;

        Ok(())
    }

    /// Rebuild the SQLite index from the JSONL file if needed.
    fn rebuild_index_if_needed(&mut self) -> Result<()> {
        if !self.jsonl_path.exists() {
            return Ok(());
        }

        let jsonl_lines = self.count_jsonl_lines()?;
        let db_count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap_or(0);

        // If the JSONL has entries the index does not, rebuild
        if jsonl_lines as i64 > db_count || db_count == 0 {
            self.rebuild_index()?;
        }

        Ok(())
    }

    /// Count lines in the JSONL file.
    fn count_jsonl_lines(&self) -> Result<usize> {
        let file = File::open(&self.jsonl_path)?;
        let reader = BufReader::new(file);
        Ok(reader.lines().count())
    }

    /// Rebuild the entire SQLite index from the JSONL file.
    ///
    /// Later lines supersede earlier ones for the same task ID.
    fn rebuild_index(&mut self) -> Result<()> {
        self.db.execute("DELETE FROM tasks", [])?;

        if !self.jsonl_path.exists() {
            return Ok(());
        }

        let file = File::open(&self.jsonl_path)?;
        let reader = BufReader::new(file);

        let mut records: HashMap<String, TaskRecord> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskRecord>(&line) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unparseable JSONL line during rebuild");
                }
            }
        }

        let tx = self.db.transaction()?;
        for record in records.values() {
            Self::insert_record_into_db(&tx, record)?;
        }
        tx.commit()?;

        Ok(())
    }

    /// Re-home tasks left RUNNING by a previous process.
    ///
    /// A graceful shutdown cancels running tasks; anything still RUNNING at
    /// open time means the process died mid-task. The claimed attempt was
    /// already counted, so the task is re-queued only if attempts remain.
    fn recover_interrupted(&mut self) -> Result<()> {
        let interrupted = self.list_by_status(TaskStatus::Running)?;
        for record in interrupted {
            let now = now_ms();
            if record.attempts_remaining() {
                tracing::warn!(task_id = %record.id, queue = %record.queue, "Re-queueing task interrupted by process death");
                self.db.execute(
                    "UPDATE tasks SET status = 'pending', scheduled_at = ?2, updated_at = ?2 WHERE id = ?1",
                    params![record.id, now],
                )?;
            } else {
                tracing::warn!(task_id = %record.id, queue = %record.queue, "Failing interrupted task with no attempts remaining");
                self.db.execute(
                    "UPDATE tasks SET status = 'failed', error = 'interrupted by process death', completed_at = ?2, updated_at = ?2 WHERE id = ?1",
                    params![record.id, now],
                )?;
            }
            if let Some(updated) = self.get(&record.id)? {
                self.append_jsonl(&updated)?;
            }
        }
        Ok(())
    }

    /// Insert a record into the SQLite database.
    fn insert_record_into_db(db: &Connection, record: &TaskRecord) -> Result<()> {
        db.execute(
            r#"
            INSERT OR REPLACE INTO tasks
            (id, queue, task_type, payload, priority, status, attempt_count,
             max_attempts, scheduled_at, started_at, completed_at,
             timeout_seconds, error, result, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                record.id,
                record.queue.as_str(),
                record.task_type,
                encode_payload(&record.payload),
                record.priority,
                record.status.as_str(),
                record.attempt_count,
                record.max_attempts,
                record.scheduled_at,
                record.started_at,
                record.completed_at,
                record.timeout_seconds,
                record.error,
                record
                    .result
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                record.created_at,
                record.updated_at,
            ],
        )?;

        Ok(())
    }

    /// Append a record snapshot to the JSONL log.
    fn append_jsonl(&self, record: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Persist a new or changed record to both storages.
    pub fn save(&mut self, record: &TaskRecord) -> Result<()> {
        self.append_jsonl(record)?;
        Self::insert_record_into_db(&self.db, record)?;
        Ok(())
    }

    /// Create and durably persist a new pending task.
    ///
    /// Malformed input is rejected with a validation error before anything
    /// is persisted.
    pub fn enqueue(
        &mut self,
        queue: QueueName,
        task_type: &str,
        payload: Payload,
        priority: i64,
        max_attempts: u32,
        timeout_seconds: u64,
    ) -> Result<TaskRecord> {
        if task_type.trim().is_empty() {
            return Err(WorkqError::Validation("task_type must not be empty".to_string()));
        }
        if max_attempts == 0 {
            return Err(WorkqError::Validation("max_attempts must be at least 1".to_string()));
        }
        if timeout_seconds == 0 {
            return Err(WorkqError::Validation("timeout_seconds must be at least 1".to_string()));
        }

        let record = TaskRecord::new(queue, task_type, payload, priority, max_attempts, timeout_seconds);
        self.save(&record)?;

        tracing::debug!(task_id = %record.id, queue = %queue, task_type = %task_type, "Task enqueued");
        Ok(record)
    }

    /// Atomically claim the next eligible task for a queue.
    ///
    /// Selects the highest-priority, earliest-created PENDING task with
    /// `scheduled_at <= now` and transitions it to RUNNING (incrementing
    /// `attempt_count`, setting `started_at` on first claim) in a single
    /// transaction. Returns None if nothing is eligible.
    pub fn claim_next(&mut self, queue: QueueName) -> Result<Option<TaskRecord>> {
        let now = now_ms();
        let tx = self.db.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks
                 WHERE queue = ?1 AND status = 'pending' AND scheduled_at <= ?2
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1",
                params![queue.as_str(), now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE tasks
             SET status = 'running',
                 attempt_count = attempt_count + 1,
                 started_at = COALESCE(started_at, ?2),
                 updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![task_id, now],
        )?;
        tx.commit()?;

        if changed == 0 {
            // Raced away inside the same process; treat as nothing eligible
            return Ok(None);
        }

        let record = self
            .get(&task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.clone()))?;
        self.append_jsonl(&record)?;

        tracing::debug!(
            task_id = %record.id,
            queue = %queue,
            attempt = record.attempt_count,
            "Task claimed"
        );
        Ok(Some(record))
    }

    /// Mark a running task completed with its result.
    ///
    /// Idempotent: completing an already-completed task is a no-op and does
    /// not disturb `completed_at`.
    pub fn complete(&mut self, task_id: &str, result: serde_json::Value) -> Result<TaskRecord> {
        let current = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;

        if current.status == TaskStatus::Completed {
            return Ok(current);
        }
        self.check_transition(&current, TaskStatus::Completed)?;

        let now = now_ms();
        self.db.execute(
            "UPDATE tasks
             SET status = 'completed', result = ?2, error = NULL,
                 completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![task_id, serde_json::to_string(&result)?, now],
        )?;

        let updated = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;
        self.append_jsonl(&updated)?;
        Ok(updated)
    }

    /// Re-queue a running task for retry after `delay`.
    ///
    /// The retry-vs-terminal decision belongs to the QueueRunner; the store
    /// only applies the transition. `attempt_count` was already incremented
    /// at claim time.
    pub fn retry(&mut self, task_id: &str, error: &str, delay: Duration) -> Result<TaskRecord> {
        let current = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;
        self.check_transition(&current, TaskStatus::Pending)?;

        let now = now_ms();
        self.db.execute(
            "UPDATE tasks
             SET status = 'pending', error = ?2, scheduled_at = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![task_id, error, now + delay.as_millis() as i64, now],
        )?;

        let updated = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;
        self.append_jsonl(&updated)?;
        Ok(updated)
    }

    /// Mark a running task terminally failed.
    pub fn fail(&mut self, task_id: &str, error: &str) -> Result<TaskRecord> {
        let current = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;
        self.check_transition(&current, TaskStatus::Failed)?;

        let now = now_ms();
        self.db.execute(
            "UPDATE tasks
             SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![task_id, error, now],
        )?;

        let updated = self
            .get(task_id)?
            .ok_or_else(|| WorkqError::TaskNotFound(task_id.to_string()))?;
        self.append_jsonl(&updated)?;
        Ok(updated)
    }

    /// Transition all RUNNING tasks to CANCELLED (shutdown path only).
    ///
    /// Cancellation is not a handler defect, so these tasks end CANCELLED
    /// rather than FAILED.
    pub fn cancel_running(&mut self) -> Result<Vec<TaskRecord>> {
        let running = self.list_by_status(TaskStatus::Running)?;
        let now = now_ms();

        let mut cancelled = Vec::with_capacity(running.len());
        for record in running {
            self.db.execute(
                "UPDATE tasks
                 SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![record.id, now],
            )?;
            if let Some(updated) = self.get(&record.id)? {
                self.append_jsonl(&updated)?;
                cancelled.push(updated);
            }
        }

        Ok(cancelled)
    }

    /// Reject invalid state-machine transitions loudly.
    fn check_transition(&self, current: &TaskRecord, next: TaskStatus) -> Result<()> {
        if !current.status.can_transition_to(next) {
            tracing::error!(
                task_id = %current.id,
                from = %current.status,
                to = %next,
                "Rejected invalid task transition"
            );
            return Err(WorkqError::InvalidTransition {
                task_id: current.id.clone(),
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }

    /// Get a task record by ID.
    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let result = self
            .db
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", SELECT_COLUMNS),
                [task_id],
                record_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// List all task records, oldest first.
    pub fn list_all(&self) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// List task records by status.
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([status.as_str()], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// List task records for one queue.
    pub fn list_by_queue(&self, queue: QueueName) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM tasks WHERE queue = ?1 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([queue.as_str()], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Distinct (queue, task_type) pairs of non-terminal tasks.
    ///
    /// Feeds the startup audit: every referenced type must have a handler.
    pub fn referenced_task_types(&self) -> Result<Vec<(QueueName, String)>> {
        let mut stmt = self.db.prepare(
            "SELECT DISTINCT queue, task_type FROM tasks
             WHERE status IN ('pending', 'running')
             ORDER BY queue, task_type",
        )?;
        let rows = stmt.query_map([], |row| {
            let queue: String = row.get(0)?;
            let task_type: String = row.get(1)?;
            Ok((queue, task_type))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (queue_raw, task_type) = row?;
            let queue = queue_raw
                .parse::<QueueName>()
                .map_err(|_| WorkqError::Storage(format!("unknown queue in store: {}", queue_raw)))?;
            out.push((queue, task_type));
        }
        Ok(out)
    }

    /// Compute the derived state of one queue.
    pub fn aggregate(&self, queue: QueueName) -> Result<QueueState> {
        Ok(self
            .aggregate_all()?
            .remove(&queue)
            .unwrap_or_else(|| QueueState::empty(queue)))
    }

    /// Compute the derived state of every queue in a single aggregation pass.
    ///
    /// One GROUP BY query, not N per-queue round-trips, so dashboard reads
    /// stay cheap. Queues with no tasks are reported as empty.
    pub fn aggregate_all(&self) -> Result<HashMap<QueueName, QueueState>> {
        let midnight = start_of_day_ms();

        let mut stmt = self.db.prepare(
            "SELECT queue,
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'completed' AND completed_at >= ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' AND completed_at >= ?1 THEN 1 ELSE 0 END),
                    AVG(CASE WHEN status = 'completed' AND started_at IS NOT NULL
                             THEN completed_at - started_at END),
                    MAX(CASE WHEN status = 'running' THEN id END)
             FROM tasks
             GROUP BY queue",
        )?;

        let rows = stmt.query_map(params![midnight], |row| {
            let queue: String = row.get(0)?;
            let pending: i64 = row.get(1)?;
            let running: i64 = row.get(2)?;
            let completed_today: i64 = row.get(3)?;
            let failed_today: i64 = row.get(4)?;
            let avg_duration_ms: Option<f64> = row.get(5)?;
            let running_task: Option<String> = row.get(6)?;
            Ok((queue, pending, running, completed_today, failed_today, avg_duration_ms, running_task))
        })?;

        let mut states: HashMap<QueueName, QueueState> = QueueName::all()
            .into_iter()
            .map(|q| (q, QueueState::empty(q)))
            .collect();

        for row in rows {
            let (queue_raw, pending, running, completed_today, failed_today, avg_duration_ms, running_task) = row?;
            let queue = queue_raw
                .parse::<QueueName>()
                .map_err(|_| WorkqError::Storage(format!("unknown queue in store: {}", queue_raw)))?;
            states.insert(
                queue,
                QueueState {
                    queue,
                    pending: pending as u64,
                    running: running as u64,
                    completed_today: completed_today as u64,
                    failed_today: failed_today as u64,
                    avg_duration_ms,
                    running_task,
                },
            );
        }

        Ok(states)
    }

    /// Get the base directory for this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Map a SQLite row onto a TaskRecord. Payload decoding is permissive.
fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let queue_raw: String = row.get(1)?;
    let payload_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let result_raw: Option<String> = row.get(13)?;

    let queue = queue_raw.parse::<QueueName>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown queue: {}", queue_raw).into(),
        )
    })?;
    let status = status_raw.parse::<TaskStatus>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown status: {}", status_raw).into(),
        )
    })?;

    Ok(TaskRecord {
        id: row.get(0)?,
        queue,
        task_type: row.get(2)?,
        payload: decode_payload(&payload_raw),
        priority: row.get(4)?,
        status,
        attempt_count: row.get(6)?,
        max_attempts: row.get(7)?,
        scheduled_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        timeout_seconds: row.get(11)?,
        error: row.get(12)?,
        result: result_raw.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/// Start of the current UTC day in milliseconds, for daily counters.
fn start_of_day_ms() -> i64 {
    use chrono::Utc;
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/// Compute a hash of the project directory path for storage isolation.
pub fn compute_project_hash(project_dir: &Path) -> Result<String> {
    let canonical = project_dir.canonicalize()?;

    let path_str = canonical.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(path_str.as_bytes());
    let result = hasher.finalize();

    // Take first 16 chars of hex
    Ok(hex::encode(&result[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_temp_store() -> (TaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn sample_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("symbol".into(), json!("AAPL"));
        payload
    }

    fn enqueue_simple(store: &mut TaskStore, priority: i64) -> TaskRecord {
        store
            .enqueue(
                QueueName::DataFetcher,
                "fetch_news",
                sample_payload(),
                priority,
                3,
                60,
            )
            .unwrap()
    }

    #[test]
    fn test_open_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let _store = TaskStore::open_at(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join(".taskstore").exists());
        assert!(temp_dir.path().join(".taskstore/taskstore.db").exists());
    }

    #[test]
    fn test_enqueue_and_get() {
        let (mut store, _temp) = create_temp_store();

        let record = enqueue_simple(&mut store, 5);
        let retrieved = store.get(&record.id).unwrap().unwrap();

        assert_eq!(retrieved, record);
        assert_eq!(retrieved.status, TaskStatus::Pending);
        assert_eq!(retrieved.payload["symbol"], "AAPL");
    }

    #[test]
    fn test_enqueue_rejects_empty_task_type() {
        let (mut store, _temp) = create_temp_store();
        let err = store
            .enqueue(QueueName::DataFetcher, "  ", Payload::new(), 0, 3, 60)
            .unwrap_err();
        assert!(matches!(err, WorkqError::Validation(_)));
        // Never persisted
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_enqueue_rejects_zero_attempts_and_timeout() {
        let (mut store, _temp) = create_temp_store();
        assert!(matches!(
            store.enqueue(QueueName::DataFetcher, "t", Payload::new(), 0, 0, 60),
            Err(WorkqError::Validation(_))
        ));
        assert!(matches!(
            store.enqueue(QueueName::DataFetcher, "t", Payload::new(), 0, 3, 0),
            Err(WorkqError::Validation(_))
        ));
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _temp) = create_temp_store();
        assert!(store.get("task-nope").unwrap().is_none());
    }

    #[test]
    fn test_claim_next_transitions_to_running() {
        let (mut store, _temp) = create_temp_store();
        let record = enqueue_simple(&mut store, 0);

        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        assert_eq!(claimed.id, record.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.started_at.is_some());

        // Nothing else eligible
        assert!(store.claim_next(QueueName::DataFetcher).unwrap().is_none());
    }

    #[test]
    fn test_claim_next_empty_queue() {
        let (mut store, _temp) = create_temp_store();
        assert!(store.claim_next(QueueName::AiAnalysis).unwrap().is_none());
    }

    #[test]
    fn test_claim_next_respects_queue_boundary() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);

        assert!(store.claim_next(QueueName::PortfolioSync).unwrap().is_none());
        assert!(store.claim_next(QueueName::DataFetcher).unwrap().is_some());
    }

    #[test]
    fn test_claim_next_priority_then_fifo() {
        let (mut store, _temp) = create_temp_store();

        // Priorities [1, 3, 2, 3, 1]; expect [3, 3, 2, 1, 1] with FIFO ties
        let t1 = enqueue_simple(&mut store, 1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = enqueue_simple(&mut store, 3);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t3 = enqueue_simple(&mut store, 2);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t4 = enqueue_simple(&mut store, 3);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t5 = enqueue_simple(&mut store, 1);

        let expected = [&t2.id, &t4.id, &t3.id, &t1.id, &t5.id];
        for want in expected {
            let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
            assert_eq!(&claimed.id, want);
            store.complete(&claimed.id, json!(null)).unwrap();
        }
    }

    #[test]
    fn test_claim_next_honors_scheduled_at() {
        let (mut store, _temp) = create_temp_store();
        let record = enqueue_simple(&mut store, 0);

        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        store
            .retry(&claimed.id, "transient", Duration::from_secs(3600))
            .unwrap();

        // Scheduled an hour out, so not eligible now
        assert!(store.claim_next(QueueName::DataFetcher).unwrap().is_none());
        let pending = store.get(&record.id).unwrap().unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert!(pending.scheduled_at > now_ms() + 3_000_000);
    }

    #[test]
    fn test_complete_sets_result_and_clears_error() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();

        let completed = store
            .complete(&claimed.id, json!({"articles": 12}))
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result, Some(json!({"articles": 12})));
        assert!(completed.error.is_none());
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();

        let first = store.complete(&claimed.id, json!(1)).unwrap();
        let second = store.complete(&claimed.id, json!(2)).unwrap();

        // Second call is a no-op: completed_at and result untouched
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.result, Some(json!(1)));
    }

    #[test]
    fn test_complete_pending_task_is_invalid() {
        let (mut store, _temp) = create_temp_store();
        let record = enqueue_simple(&mut store, 0);

        let err = store.complete(&record.id, json!(null)).unwrap_err();
        assert!(matches!(err, WorkqError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_requeues_with_error() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();

        let retried = store
            .retry(&claimed.id, "rate limited", Duration::from_millis(0))
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.error.as_deref(), Some("rate limited"));
        assert_eq!(retried.attempt_count, 1);

        // Eligible again, attempt counted on second claim
        let reclaimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn test_started_at_set_once() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);

        let first = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        let first_started = first.started_at.unwrap();

        store
            .retry(&first.id, "transient", Duration::from_millis(0))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let second = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        assert_eq!(second.started_at, Some(first_started));
    }

    #[test]
    fn test_fail_is_terminal() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();

        let failed = store.fail(&claimed.id, "handler rejected input").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("handler rejected input"));
        assert!(failed.completed_at.is_some());

        // Terminal: no further transitions
        assert!(matches!(
            store.retry(&claimed.id, "x", Duration::ZERO),
            Err(WorkqError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_running() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        enqueue_simple(&mut store, 0);

        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        let cancelled = store.cancel_running().unwrap();

        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, claimed.id);
        assert_eq!(cancelled[0].status, TaskStatus::Cancelled);

        // The still-pending task is untouched
        let pending = store.list_by_status(TaskStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_list_by_queue_and_status() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        store
            .enqueue(QueueName::AiAnalysis, "analyze", Payload::new(), 0, 3, 600)
            .unwrap();

        assert_eq!(store.list_by_queue(QueueName::DataFetcher).unwrap().len(), 1);
        assert_eq!(store.list_by_queue(QueueName::AiAnalysis).unwrap().len(), 1);
        assert_eq!(store.list_by_status(TaskStatus::Pending).unwrap().len(), 2);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_referenced_task_types() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        enqueue_simple(&mut store, 0);
        store
            .enqueue(QueueName::AiAnalysis, "analyze", Payload::new(), 0, 3, 600)
            .unwrap();

        let referenced = store.referenced_task_types().unwrap();
        assert_eq!(referenced.len(), 2);
        assert!(referenced.contains(&(QueueName::DataFetcher, "fetch_news".to_string())));
        assert!(referenced.contains(&(QueueName::AiAnalysis, "analyze".to_string())));
    }

    #[test]
    fn test_aggregate_counts() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);
        enqueue_simple(&mut store, 0);
        enqueue_simple(&mut store, 0);

        let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
        store.complete(&claimed.id, json!(null)).unwrap();

        let running = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();

        let state = store.aggregate(QueueName::DataFetcher).unwrap();
        assert_eq!(state.pending, 1);
        assert_eq!(state.running, 1);
        assert_eq!(state.completed_today, 1);
        assert_eq!(state.failed_today, 0);
        assert!(state.avg_duration_ms.is_some());
        assert_eq!(state.running_task, Some(running.id));
    }

    #[test]
    fn test_aggregate_all_covers_empty_queues() {
        let (mut store, _temp) = create_temp_store();
        enqueue_simple(&mut store, 0);

        let states = store.aggregate_all().unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states[&QueueName::DataFetcher].pending, 1);
        assert_eq!(states[&QueueName::PortfolioSync].pending, 0);
        assert_eq!(states[&QueueName::AiAnalysis].pending, 0);
    }

    #[test]
    fn test_attempt_count_never_exceeds_max() {
        let (mut store, _temp) = create_temp_store();
        store
            .enqueue(QueueName::DataFetcher, "flaky", Payload::new(), 0, 3, 60)
            .unwrap();

        for _ in 0..3 {
            let claimed = store.claim_next(QueueName::DataFetcher).unwrap().unwrap();
            assert!(claimed.attempt_count <= claimed.max_attempts);
            if claimed.attempts_remaining() {
                store.retry(&claimed.id, "transient", Duration::ZERO).unwrap();
            } else {
                store.fail(&claimed.id, "attempts exhausted").unwrap();
            }
        }

        let final_record = store.list_all().unwrap().pop().unwrap();
        assert_eq!(final_record.status, TaskStatus::Failed);
        assert_eq!(final_record.attempt_count, 3);
    }

    #[test]
    fn test_jsonl_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let task_id;

        {
            let mut store = TaskStore::open_at(temp_dir.path()).unwrap();
            task_id = enqueue_simple(&mut store, 7).id;
        }

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            let loaded = store.get(&task_id).unwrap().unwrap();
            assert_eq!(loaded.priority, 7);
            assert_eq!(loaded.payload["symbol"], "AAPL");
        }
    }

    #[test]
    fn test_rebuild_index() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut store = TaskStore::open_at(temp_dir.path()).unwrap();
            enqueue_simple(&mut store, 0);
            enqueue_simple(&mut store, 0);
        }

        // Delete the SQLite file to force rebuild from JSONL
        let db_path = temp_dir.path().join(".taskstore/taskstore.db");
        fs::remove_file(&db_path).unwrap();

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            assert_eq!(store.list_all().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_recover_interrupted_requeues() {
        let temp_dir = TempDir::new().unwrap();
        let task_id;

        {
            let mut store = TaskStore::open_at(temp_dir.path()).unwrap();
            enqueue_simple(&mut store, 0);
            task_id = store
                .claim_next(QueueName::DataFetcher)
                .unwrap()
                .unwrap()
                .id;
            // Simulated crash: store dropped while task is RUNNING
        }

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            let recovered = store.get(&task_id).unwrap().unwrap();
            assert_eq!(recovered.status, TaskStatus::Pending);
            assert_eq!(recovered.attempt_count, 1);
        }
    }

    #[test]
    fn test_recover_interrupted_fails_when_attempts_exhausted() {
        let temp_dir = TempDir::new().unwrap();
        let task_id;

        {
            let mut store = TaskStore::open_at(temp_dir.path()).unwrap();
            store
                .enqueue(QueueName::DataFetcher, "one_shot", Payload::new(), 0, 1, 60)
                .unwrap();
            task_id = store
                .claim_next(QueueName::DataFetcher)
                .unwrap()
                .unwrap()
                .id;
        }

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            let recovered = store.get(&task_id).unwrap().unwrap();
            assert_eq!(recovered.status, TaskStatus::Failed);
            assert!(recovered.error.as_deref().unwrap().contains("interrupted"));
        }
    }

    #[test]
    fn test_compute_project_hash() {
        let temp_dir = TempDir::new().unwrap();
        let hash = compute_project_hash(temp_dir.path()).unwrap();

        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let hash2 = compute_project_hash(temp_dir.path()).unwrap();
        assert_eq!(hash, hash2);
    }
}
