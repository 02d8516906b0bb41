//! Ingest task queue - gate-sharded workers with retry and task status
//!
//! Every accepted event becomes a typed `IngestTask` with an explicit task
//! id (the caller's idempotency key). Tasks are routed to a worker shard by
//! a hash of the gate id, so all events for one gate are consumed by a
//! single worker in FIFO order; events for different gates proceed in
//! parallel.
//!
//! Retryable engine failures (lock contention) are retried in place with
//! capped exponential backoff; terminal failures are recorded at once. The
//! status store backs the task-status endpoint.

use crate::domain::event::PresenceEvent;
use crate::infra::metrics::Metrics;
use crate::services::engine::{DerivationEngine, EngineError};
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// One unit of ingest work
#[derive(Debug, Clone)]
pub struct IngestTask {
    /// Idempotency key, also the handle for status polling
    pub task_id: String,
    pub event: PresenceEvent,
}

/// Report attached to a finished task, mirroring the ingest API contract
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub action: String,
    pub time: String,
    pub result: String,
}

impl TaskReport {
    fn new(action: &str, result: String) -> Self {
        Self {
            action: action.to_string(),
            time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            result,
        }
    }
}

/// Lifecycle of an ingest task
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUCCESS")]
    Done { result: TaskReport },
    #[serde(rename = "FAILURE")]
    Failed { error: String },
}

/// Shared store of task states, read by the status endpoint
///
/// Unknown ids read as `Pending`: the caller may poll before the enqueue
/// write is visible, and a pending answer is always safe.
#[derive(Clone, Default)]
pub struct TaskStatusStore {
    states: Arc<RwLock<FxHashMap<String, TaskState>>>,
}

impl TaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, task_id: &str, state: TaskState) {
        self.states.write().insert(task_id.to_string(), state);
    }

    pub fn get(&self, task_id: &str) -> TaskState {
        self.states.read().get(task_id).cloned().unwrap_or(TaskState::Pending)
    }
}

/// Retry policy for retryable engine failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before retrying the given (0-based) attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Sender half of the ingest queue
///
/// Routes tasks to shards by gate hash so per-gate ordering holds.
#[derive(Clone)]
pub struct IngestSender {
    shards: Vec<mpsc::Sender<IngestTask>>,
    status: TaskStatusStore,
    metrics: Arc<Metrics>,
}

impl IngestSender {
    fn shard_for(&self, gate_id: &str) -> usize {
        let mut hasher = FxHasher::default();
        gate_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Enqueue a task; returns false when the shard's queue is full
    pub fn enqueue(&self, task: IngestTask) -> bool {
        self.metrics.record_event_received();
        self.status.set(&task.task_id, TaskState::Pending);

        let shard = self.shard_for(&task.event.gate_id);
        match self.shards[shard].try_send(task) {
            Ok(()) => true,
            Err(e) => {
                let task = match e {
                    mpsc::error::TrySendError::Full(t) => t,
                    mpsc::error::TrySendError::Closed(t) => t,
                };
                self.metrics.record_ingest_dropped();
                warn!(
                    task_id = %task.task_id,
                    gate_id = %task.event.gate_id,
                    shard = %shard,
                    "ingest_queue_full"
                );
                false
            }
        }
    }

    pub fn status_store(&self) -> &TaskStatusStore {
        &self.status
    }
}

/// One ingest worker draining a single shard
pub struct IngestWorker {
    shard: usize,
    rx: mpsc::Receiver<IngestTask>,
    engine: Arc<DerivationEngine>,
    status: TaskStatusStore,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl IngestWorker {
    /// Run the worker until the channel closes or shutdown fires
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(shard = %self.shard, "ingest_worker_started");

        loop {
            tokio::select! {
                task = self.rx.recv() => {
                    match task {
                        Some(task) => self.process(task).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(shard = %self.shard, "ingest_worker_stopped");
    }

    async fn process(&self, task: IngestTask) {
        self.status.set(&task.task_id, TaskState::Started);

        let mut attempt = 0u32;
        loop {
            match self.engine.handle_event(&task.event) {
                Ok(outcome) => {
                    self.status.set(
                        &task.task_id,
                        TaskState::Done { result: TaskReport::new("done", outcome.message) },
                    );
                    return;
                }
                Err(e) if e.retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    self.metrics.record_task_retry();
                    debug!(
                        task_id = %task.task_id,
                        gate_id = %task.event.gate_id,
                        attempt = %attempt,
                        delay_ms = %delay.as_millis(),
                        "task_retry_scheduled"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.fail(&task, &e, attempt);
                    return;
                }
            }
        }
    }

    fn fail(&self, task: &IngestTask, error: &EngineError, attempts: u32) {
        self.metrics.record_task_failed();
        error!(
            task_id = %task.task_id,
            gate_id = %task.event.gate_id,
            attempts = %attempts,
            error = %error,
            "task_failed"
        );
        self.status.set(&task.task_id, TaskState::Failed { error: error.to_string() });
    }
}

/// Create the ingest queue and its worker shards
///
/// Returns the sender (for the HTTP layer) and the workers (to be spawned).
pub fn create_ingest_workers(
    workers: usize,
    queue_capacity: usize,
    engine: Arc<DerivationEngine>,
    status: TaskStatusStore,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
) -> (IngestSender, Vec<IngestWorker>) {
    let workers = workers.max(1);
    let mut shards = Vec::with_capacity(workers);
    let mut worker_handles = Vec::with_capacity(workers);

    for shard in 0..workers {
        let (tx, rx) = mpsc::channel(queue_capacity);
        shards.push(tx);
        worker_handles.push(IngestWorker {
            shard,
            rx,
            engine: engine.clone(),
            status: status.clone(),
            retry,
            metrics: metrics.clone(),
        });
    }

    let sender = IngestSender { shards, status, metrics };
    (sender, worker_handles)
}
