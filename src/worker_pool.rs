//! Worker pool for CPU-bound chunk work
//!
//! Hashing, compression and validation run on `spawn_blocking` threads,
//! dispatched by a fixed set of worker tasks consuming a FIFO queue. Each
//! dispatch is raced against a per-task timeout; a timed-out or panicked task
//! is re-enqueued at the head of the queue until its retry budget is spent.

use crate::compressor::{CompressedChunk, Compressor};
use crate::config::WorkerConfig;
use crate::error::{Result, UploadError};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Kind of CPU task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Compress,
    Validate,
    Hash,
}

/// One unit of work submitted to the pool
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: u64,
    pub kind: TaskKind,
    pub payload: Bytes,
    /// For `Validate`: the size the payload must have
    pub expected_size: Option<u64>,
    pub attempts: u32,
}

/// Result of a completed task
#[derive(Debug, Clone)]
pub enum TaskOutput {
    Compressed(CompressedChunk),
    /// SHA-256 hex of the payload
    Hash(String),
    /// Validation passed; carries the payload's SHA-256 hex
    Validated { checksum: String },
}

struct QueuedTask {
    task: WorkerTask,
    reply: oneshot::Sender<Result<TaskOutput>>,
}

struct PoolShared {
    queue: Mutex<VecDeque<QueuedTask>>,
    notify: Notify,
    shutdown: CancellationToken,
    task_timeout: Duration,
    retry_attempts: u32,
}

/// Fixed-size pool of workers for compress/validate/hash tasks
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Spawn `min(max_workers, available_parallelism)` workers.
    ///
    /// `retry_attempts` bounds how often a failed or timed-out task is
    /// re-dispatched before its submitter sees an error.
    pub fn new(config: &WorkerConfig, retry_attempts: u32) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        let count = std::cmp::max(1, std::cmp::min(config.max_workers, cores));

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            retry_attempts,
        });

        let workers = (0..count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    worker_loop(worker_id, shared).await;
                })
            })
            .collect();

        debug!("worker pool started with {} workers", count);

        WorkerPool {
            shared,
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(1),
        }
    }

    /// Submit a task and await its outcome.
    ///
    /// The returned future resolves once the task succeeds or its retry
    /// budget is exhausted.
    pub async fn submit(
        &self,
        kind: TaskKind,
        payload: Bytes,
        expected_size: Option<u64>,
    ) -> Result<TaskOutput> {
        if self.shared.shutdown.is_cancelled() {
            return Err(UploadError::Worker("worker pool is shut down".into()));
        }

        let task = WorkerTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            payload,
            expected_size,
            attempts: 0,
        };

        let task_id = task.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(QueuedTask { task, reply: tx });
        }
        self.shared.notify.notify_one();

        // A shutdown racing the enqueue above would strand the task; pull it
        // back out rather than waiting on a reply that never comes.
        if self.shared.shutdown.is_cancelled() {
            let mut queue = self.shared.queue.lock().unwrap();
            if let Some(pos) = queue.iter().position(|q| q.task.id == task_id) {
                let _ = queue.remove(pos);
                return Err(UploadError::Worker("worker pool is shut down".into()));
            }
        }

        rx.await
            .map_err(|_| UploadError::Worker("worker pool dropped the task".into()))?
    }

    /// Stop all workers and reject everything still queued
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();

        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let pending: Vec<_> = self.shared.queue.lock().unwrap().drain(..).collect();
        for queued in pending {
            let _ = queued
                .reply
                .send(Err(UploadError::Worker("worker pool shut down".into())));
        }
    }

    /// Number of tasks waiting for a worker
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    loop {
        let queued = { shared.queue.lock().unwrap().pop_front() };

        let mut queued = match queued {
            Some(queued) => queued,
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = shared.notify.notified() => {}
                }
                continue;
            }
        };

        if queued.reply.is_closed() {
            // Submitter gave up; drop the task
            continue;
        }

        let task = queued.task.clone();
        let work = tokio::task::spawn_blocking(move || execute_task(&task));

        let outcome = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = queued
                    .reply
                    .send(Err(UploadError::Worker("worker pool shut down".into())));
                return;
            }
            result = tokio::time::timeout(shared.task_timeout, work) => match result {
                Ok(Ok(output)) => output,
                // A panicked blocking task is equivalent to a crashed worker:
                // the in-flight task goes back for retry.
                Ok(Err(join_err)) => Err(UploadError::Worker(format!(
                    "task {} crashed: {}",
                    queued.task.id, join_err
                ))),
                Err(_) => Err(UploadError::Worker(format!(
                    "task {} timed out after {:?}",
                    queued.task.id, shared.task_timeout
                ))),
            },
        };

        match outcome {
            Ok(output) => {
                let _ = queued.reply.send(Ok(output));
            }
            Err(err) => {
                queued.task.attempts += 1;
                if queued.task.attempts <= shared.retry_attempts {
                    warn!(
                        "worker {}: task {} failed ({}), retry {}/{}",
                        worker_id,
                        queued.task.id,
                        err,
                        queued.task.attempts,
                        shared.retry_attempts
                    );
                    // Retries go to the head of the queue
                    shared.queue.lock().unwrap().push_front(queued);
                    shared.notify.notify_one();
                } else {
                    let _ = queued.reply.send(Err(err));
                }
            }
        }
    }
}

fn execute_task(task: &WorkerTask) -> Result<TaskOutput> {
    match task.kind {
        TaskKind::Compress => {
            let out = Compressor::new().compress(&task.payload)?;
            Ok(TaskOutput::Compressed(out))
        }
        TaskKind::Hash => Ok(TaskOutput::Hash(sha256_hex(&task.payload))),
        TaskKind::Validate => {
            if let Some(expected) = task.expected_size {
                if task.payload.len() as u64 != expected {
                    return Err(UploadError::Validation(format!(
                        "chunk payload is {} bytes, expected {}",
                        task.payload.len(),
                        expected
                    )));
                }
            }
            if task.payload.is_empty() {
                return Err(UploadError::Validation("chunk payload is empty".into()));
            }
            Ok(TaskOutput::Validated {
                checksum: sha256_hex(&task.payload),
            })
        }
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
