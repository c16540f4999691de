//! Durable ordered task queue.
//!
//! Tasks are FIFO by `created_at` (ties broken by id), persisted to an
//! embedded database, and claimed by the executor one at a time by
//! default. `paused` is a queue-level flag: a paused queue stops claiming
//! but lets the running task finish. Tasks found `running` at startup are
//! crash leftovers and return to the head of the queue.
//!
//! Terminal transitions (`completed`, `failed`, `cancelled`) publish
//! `task_complete` from here so there is exactly one publisher for
//! lifecycle events.

use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::dedupe::DedupeMode;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::paths::RelPath;
use crate::types::{now_ms, CancelToken, Side};

// ---------------------------------------------------------------------------
// Task model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Tagged task payload. Unknown variants are rejected at the API boundary
/// by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Copy {
        src_side: Side,
        src_relpath: RelPath,
        dst_side: Side,
        dst_relpath: RelPath,
    },
    Delete {
        side: Side,
        relpath: RelPath,
        /// Dedupe-initiated deletes bypass the sync-delete policy.
        #[serde(default)]
        from_dedupe: bool,
    },
    Verify {
        #[serde(default)]
        side: Option<Side>,
        #[serde(default)]
        folder: Option<RelPath>,
        #[serde(default)]
        relpath: Option<RelPath>,
    },
    HashFile {
        side: Side,
        relpath: RelPath,
    },
    DedupeScan {
        side: Side,
        mode: DedupeMode,
        min_size_bytes: u64,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Copy { .. } => "copy",
            TaskPayload::Delete { .. } => "delete",
            TaskPayload::Verify { .. } => "verify",
            TaskPayload::HashFile { .. } => "hash_file",
            TaskPayload::DedupeScan { .. } => "dedupe_scan",
        }
    }

    /// The `(side, relpath)` keys whose on-disk state this task mutates.
    /// Tasks sharing a key are mutually exclusive under concurrency > 1.
    pub fn write_keys(&self) -> Vec<(Side, RelPath)> {
        match self {
            TaskPayload::Copy { dst_side, dst_relpath, .. } => {
                vec![(*dst_side, dst_relpath.clone())]
            }
            TaskPayload::Delete { side, relpath, .. } => vec![(*side, relpath.clone())],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub size_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub retry_count: u32,
    /// Most recent error, surfaced verbatim by the API.
    pub error: Option<String>,
    /// Every intermediate error across retries.
    pub errors: Vec<String>,
    /// Type-specific completion payload (e.g. dedupe scan summary).
    pub result: Option<serde_json::Value>,
    /// Earliest claim time after a transient failure. Not persisted.
    #[serde(skip)]
    not_before: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueInner {
    tasks: BTreeMap<String, Task>,
    /// Pending ids, head first.
    pending: VecDeque<String>,
    running: Vec<String>,
    paused: bool,
    shutdown: bool,
}

pub struct Queue {
    conn: Mutex<Connection>,
    inner: Mutex<QueueInner>,
    runnable: Condvar,
    cancels: DashMap<String, CancelToken>,
    bus: Arc<EventBus>,
    retry_limit: u32,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id                TEXT PRIMARY KEY,
    payload           TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        INTEGER NOT NULL,
    started_at        INTEGER,
    finished_at       INTEGER,
    size_bytes        INTEGER,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    errors            TEXT NOT NULL DEFAULT '[]',
    result            TEXT
);";

impl Queue {
    pub fn open(path: &Path, bus: Arc<EventBus>, retry_limit: u32) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, bus, retry_limit)
    }

    pub fn open_in_memory(bus: Arc<EventBus>, retry_limit: u32) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, bus, retry_limit)
    }

    fn init(conn: Connection, bus: Arc<EventBus>, retry_limit: u32) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let mut tasks = BTreeMap::new();
        let mut recovered: Vec<String> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, payload, status, created_at, started_at, finished_at, size_bytes,
                        bytes_transferred, retry_count, error, errors, result
                 FROM tasks ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<String>>(11)?,
                ))
            })?;
            for row in rows {
                let (id, payload, status, created_at, started_at, finished_at, size_bytes,
                    bytes_transferred, retry_count, error, errors, result) = row?;
                let Ok(payload) = serde_json::from_str::<TaskPayload>(&payload) else {
                    tracing::warn!(task_id = id.as_str(), "Dropping task with unreadable payload");
                    continue;
                };
                let Ok(status) = status.parse::<TaskStatus>() else { continue };
                let mut task = Task {
                    id: id.clone(),
                    payload,
                    status,
                    created_at,
                    started_at,
                    finished_at,
                    size_bytes: size_bytes.map(|v| v as u64),
                    bytes_transferred: bytes_transferred as u64,
                    retry_count: retry_count as u32,
                    error,
                    errors: serde_json::from_str(&errors).unwrap_or_default(),
                    result: result.and_then(|r| serde_json::from_str(&r).ok()),
                    not_before: None,
                };
                match task.status {
                    // A task running at the previous shutdown was interrupted;
                    // it goes back to the head of the queue.
                    TaskStatus::Running => {
                        task.status = TaskStatus::Pending;
                        task.started_at = None;
                        recovered.push(id.clone());
                    }
                    TaskStatus::Pending => pending.push(id.clone()),
                    _ => {}
                }
                tasks.insert(id, task);
            }
        }

        let mut order: VecDeque<String> = VecDeque::new();
        order.extend(recovered);
        order.extend(pending);

        let queue = Self {
            conn: Mutex::new(conn),
            inner: Mutex::new(QueueInner {
                tasks,
                pending: order,
                running: Vec::new(),
                paused: false,
                shutdown: false,
            }),
            runnable: Condvar::new(),
            cancels: DashMap::new(),
            bus,
            retry_limit,
        };

        // Persist the recovery transitions.
        {
            let inner = queue.inner.lock().unwrap();
            for id in inner.pending.clone() {
                queue.persist(&inner.tasks[&id]);
            }
        }
        Ok(queue)
    }

    fn persist(&self, task: &Task) {
        let conn = self.conn.lock().unwrap();
        let res = conn.execute(
            "INSERT INTO tasks (id, payload, status, created_at, started_at, finished_at,
                                size_bytes, bytes_transferred, retry_count, error, errors, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                size_bytes = excluded.size_bytes,
                bytes_transferred = excluded.bytes_transferred,
                retry_count = excluded.retry_count,
                error = excluded.error,
                errors = excluded.errors,
                result = excluded.result",
            params![
                task.id,
                serde_json::to_string(&task.payload).unwrap_or_default(),
                task.status.as_str(),
                task.created_at,
                task.started_at,
                task.finished_at,
                task.size_bytes.map(|v| v as i64),
                task.bytes_transferred as i64,
                task.retry_count as i64,
                task.error,
                serde_json::to_string(&task.errors).unwrap_or_else(|_| "[]".into()),
                task.result.as_ref().map(|r| r.to_string()),
            ],
        );
        if let Err(e) = res {
            tracing::error!(task_id = task.id.as_str(), error = %e, "Failed to persist task");
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Append a task at the tail and wake the executor.
    pub fn enqueue(&self, payload: TaskPayload) -> Result<Task> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            payload,
            status: TaskStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            size_bytes: None,
            bytes_transferred: 0,
            retry_count: 0,
            error: None,
            errors: Vec::new(),
            result: None,
            not_before: None,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.push_back(task.id.clone());
            inner.tasks.insert(task.id.clone(), task.clone());
            self.persist(&task);
        }
        self.runnable.notify_all();
        Ok(task)
    }

    /// Running task first, then pending in queue order, then terminal tasks
    /// newest first.
    pub fn list(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Task> = Vec::with_capacity(inner.tasks.len());
        for id in &inner.running {
            out.push(inner.tasks[id].clone());
        }
        for id in &inner.pending {
            out.push(inner.tasks[id].clone());
        }
        let mut done: Vec<&Task> =
            inner.tasks.values().filter(|t| t.status.is_terminal()).collect();
        done.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.created_at.cmp(&a.created_at)));
        out.extend(done.into_iter().cloned());
        out
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        self.runnable.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Cancel a task. Pending tasks become terminal immediately; a running
    /// task has its cancellation handle signalled and finishes through the
    /// executor. Idempotent: cancelling a terminal task returns it as-is.
    pub fn cancel(&self, id: &str) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get(id)?.clone();
        match task.status {
            TaskStatus::Pending => {
                inner.pending.retain(|p| p != id);
                let task = inner.tasks.get_mut(id).unwrap();
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(now_ms());
                let snapshot = task.clone();
                self.persist(&snapshot);
                drop(inner);
                self.publish_complete(&snapshot);
                Some(snapshot)
            }
            TaskStatus::Running => {
                if let Some(token) = self.cancels.get(id) {
                    token.cancel();
                }
                Some(task)
            }
            _ => Some(task),
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .pending
                .iter()
                .chain(inner.running.iter())
                .cloned()
                .collect()
        };
        let n = ids.len();
        for id in ids {
            self.cancel(&id);
        }
        n
    }

    /// Stop the executor loops.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.runnable.notify_all();
    }

    // -----------------------------------------------------------------------
    // Executor side
    // -----------------------------------------------------------------------

    /// Block until a claimable task exists, claim it, and return it with its
    /// cancellation handle. Returns `None` on shutdown.
    pub fn claim_next(&self) -> Option<(Task, CancelToken)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return None;
            }
            if !inner.paused {
                if let Some(claimed) = self.try_claim_locked(&mut inner) {
                    return Some(claimed);
                }
            }
            let wait = next_wakeup(&inner)
                .unwrap_or(Duration::from_millis(500))
                .max(Duration::from_millis(20));
            let (guard, _timeout) = self.runnable.wait_timeout(inner, wait).unwrap();
            inner = guard;
        }
    }

    fn try_claim_locked(&self, inner: &mut MutexGuard<'_, QueueInner>) -> Option<(Task, CancelToken)> {
        let now = Instant::now();
        let busy: Vec<(Side, RelPath)> = inner
            .running
            .iter()
            .flat_map(|id| inner.tasks[id].payload.write_keys())
            .collect();

        let pos = inner.pending.iter().position(|id| {
            let task = &inner.tasks[id];
            if task.not_before.is_some_and(|t| t > now) {
                return false;
            }
            !task.payload.write_keys().iter().any(|k| busy.contains(k))
        })?;

        let id = inner.pending.remove(pos).unwrap();
        let token = CancelToken::new();
        self.cancels.insert(id.clone(), token.clone());
        inner.running.push(id.clone());
        let task = inner.tasks.get_mut(&id).unwrap();
        task.status = TaskStatus::Running;
        task.started_at = Some(now_ms());
        task.not_before = None;
        let snapshot = task.clone();
        self.persist(&snapshot);
        Some((snapshot, token))
    }

    /// Record streaming progress. `bytes_transferred` is monotonic per task.
    pub fn update_progress(&self, id: &str, bytes_transferred: u64, size_bytes: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(id) {
            task.bytes_transferred = task.bytes_transferred.max(bytes_transferred);
            if size_bytes.is_some() {
                task.size_bytes = size_bytes;
            }
            let snapshot = task.clone();
            self.persist(&snapshot);
        }
    }

    pub fn complete(&self, id: &str, result: Option<serde_json::Value>) {
        self.finish(id, TaskStatus::Completed, None, result);
    }

    pub fn fail(&self, id: &str, error: String) {
        self.finish(id, TaskStatus::Failed, Some(error), None);
    }

    pub fn mark_cancelled(&self, id: &str) {
        self.finish(id, TaskStatus::Cancelled, None, None);
    }

    fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            inner.running.retain(|r| r != id);
            let Some(task) = inner.tasks.get_mut(id) else { return };
            task.status = status;
            task.finished_at = Some(now_ms());
            if let Some(e) = error {
                task.errors.push(e.clone());
                task.error = Some(e);
            }
            if result.is_some() {
                task.result = result;
            }
            let snapshot = task.clone();
            self.persist(&snapshot);
            snapshot
        };
        self.cancels.remove(id);
        self.publish_complete(&snapshot);
        self.runnable.notify_all();
    }

    /// Put a transiently failed task back at the head with a backoff delay.
    /// The caller has already checked the retry budget.
    pub fn requeue_transient(&self, id: &str, error: String, backoff: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.running.retain(|r| r != id);
            let Some(task) = inner.tasks.get_mut(id) else { return };
            task.status = TaskStatus::Pending;
            task.retry_count += 1;
            task.errors.push(error.clone());
            task.error = Some(error);
            task.not_before = Some(Instant::now() + backoff);
            task.started_at = None;
            let snapshot = task.clone();
            inner.pending.push_front(id.to_string());
            self.persist(&snapshot);
        }
        self.cancels.remove(id);
        self.runnable.notify_all();
    }

    fn publish_complete(&self, task: &Task) {
        self.bus.publish(Event::TaskComplete {
            task_id: task.id.clone(),
            status: task.status,
            error: task.error.clone(),
            detail: task.result.clone(),
        });
    }
}

/// Earliest backoff expiry among pending tasks, as a wait duration.
fn next_wakeup(inner: &QueueInner) -> Option<Duration> {
    let now = Instant::now();
    inner
        .pending
        .iter()
        .filter_map(|id| inner.tasks[id].not_before)
        .map(|t| t.saturating_duration_since(now))
        .min()
}
