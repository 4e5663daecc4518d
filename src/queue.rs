//! Priority scheduling across concurrent file uploads
//!
//! Items are ordered by priority (descending), then retry attempts
//! (ascending), then enqueue time (ascending). A global concurrency cap
//! bounds how many items can be `Uploading` at once. Every mutation emits a
//! queue event on a broadcast channel.

use crate::models::{epoch_ms, QueueItem, QueueItemStatus, UploadStats};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// What changed in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    Enqueued,
    Started,
    Completed,
    Failed,
    Retried,
    Removed,
    StatsUpdated,
}

/// Event emitted after every queue mutation
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub file_id: String,
    pub stats: QueueStats,
}

/// Aggregate queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    pub active_uploads: usize,
}

struct QueueState {
    items: Vec<QueueItem>,
    active_uploads: usize,
}

/// Priority queue over pending uploads with a global concurrency cap
pub struct UploadQueue {
    state: Mutex<QueueState>,
    max_concurrent: usize,
    events: broadcast::Sender<QueueEvent>,
}

impl UploadQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        UploadQueue {
            state: Mutex::new(QueueState {
                items: Vec::new(),
                active_uploads: 0,
            }),
            max_concurrent: max_concurrent.max(1),
            events,
        }
    }

    /// Add a file to the queue; returns its position among queued items
    pub fn enqueue(&self, file_id: impl Into<String>, priority: i32) -> usize {
        let file_id = file_id.into();
        {
            let mut state = self.state.lock().unwrap();
            state.items.push(QueueItem {
                file_id: file_id.clone(),
                priority,
                status: QueueItemStatus::Queued,
                retry_attempts: 0,
                start_time_ms: epoch_ms(),
                stats: UploadStats::default(),
            });
            sort_items(&mut state.items);
        }
        self.emit(QueueEventKind::Enqueued, &file_id);
        self.position(&file_id).unwrap_or(0)
    }

    /// Hand out the next queued item if a concurrency slot is free,
    /// transitioning it to `Uploading`.
    pub fn next(&self) -> Option<QueueItem> {
        let taken = {
            let mut state = self.state.lock().unwrap();
            if state.active_uploads >= self.max_concurrent {
                return None;
            }
            let item = state
                .items
                .iter_mut()
                .find(|i| i.status == QueueItemStatus::Queued)?;
            item.status = QueueItemStatus::Uploading;
            let taken = item.clone();
            state.active_uploads += 1;
            taken
        };
        debug!("queue handing out {}", taken.file_id);
        self.emit(QueueEventKind::Started, &taken.file_id);
        Some(taken)
    }

    /// Mark an uploading item finished, freeing its slot
    pub fn complete(&self, file_id: &str) {
        self.finish(file_id, QueueItemStatus::Completed, QueueEventKind::Completed);
    }

    /// Mark an uploading item failed, freeing its slot
    pub fn fail(&self, file_id: &str) {
        self.finish(file_id, QueueItemStatus::Error, QueueEventKind::Failed);
    }

    fn finish(&self, file_id: &str, status: QueueItemStatus, kind: QueueEventKind) {
        let found = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut found = false;
            for item in state.items.iter_mut() {
                if item.file_id == file_id {
                    if item.status == QueueItemStatus::Uploading {
                        state.active_uploads = state.active_uploads.saturating_sub(1);
                    }
                    item.status = status;
                    found = true;
                    break;
                }
            }
            found
        };
        if found {
            self.emit(kind, file_id);
        }
    }

    /// Requeue a failed or running item, bumping its retry count.
    ///
    /// Retry attempts participate in the ordering, so the queue is re-sorted.
    pub fn retry(&self, file_id: &str) {
        let found = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut found = false;
            for item in state.items.iter_mut() {
                if item.file_id == file_id {
                    if item.status == QueueItemStatus::Uploading {
                        state.active_uploads = state.active_uploads.saturating_sub(1);
                    }
                    item.status = QueueItemStatus::Queued;
                    item.retry_attempts += 1;
                    found = true;
                    break;
                }
            }
            if found {
                sort_items(&mut state.items);
            }
            found
        };
        if found {
            self.emit(QueueEventKind::Retried, file_id);
        }
    }

    /// Drop an item entirely
    pub fn remove(&self, file_id: &str) {
        let found = {
            let mut state = self.state.lock().unwrap();
            let before = state.items.len();
            let was_uploading = state
                .items
                .iter()
                .any(|i| i.file_id == file_id && i.status == QueueItemStatus::Uploading);
            state.items.retain(|i| i.file_id != file_id);
            if was_uploading {
                state.active_uploads = state.active_uploads.saturating_sub(1);
            }
            state.items.len() < before
        };
        if found {
            self.emit(QueueEventKind::Removed, file_id);
        }
    }

    /// Update the live stats attached to an item
    pub fn update_stats(&self, file_id: &str, stats: UploadStats) {
        let found = {
            let mut state = self.state.lock().unwrap();
            let mut found = false;
            for item in state.items.iter_mut() {
                if item.file_id == file_id {
                    item.stats = stats.clone();
                    found = true;
                    break;
                }
            }
            found
        };
        if found {
            self.emit(QueueEventKind::StatsUpdated, file_id);
        }
    }

    /// Position among queued items (0 = next to be scheduled)
    pub fn position(&self, file_id: &str) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .filter(|i| i.status == QueueItemStatus::Queued)
            .position(|i| i.file_id == file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<QueueItem> {
        let state = self.state.lock().unwrap();
        state.items.iter().find(|i| i.file_id == file_id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        queue_stats(&state)
    }

    /// Subscribe to queue mutations
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: QueueEventKind, file_id: &str) {
        let stats = self.stats();
        let _ = self.events.send(QueueEvent {
            kind,
            file_id: file_id.to_string(),
            stats,
        });
    }
}

fn queue_stats(state: &QueueState) -> QueueStats {
    let mut stats = QueueStats {
        total: state.items.len(),
        active_uploads: state.active_uploads,
        ..Default::default()
    };
    for item in &state.items {
        match item.status {
            QueueItemStatus::Queued => stats.queued += 1,
            QueueItemStatus::Uploading => stats.uploading += 1,
            QueueItemStatus::Completed => stats.completed += 1,
            QueueItemStatus::Error => stats.failed += 1,
            QueueItemStatus::Paused => {}
        }
    }
    stats
}

/// Priority descending, retry attempts ascending, enqueue time ascending
fn sort_items(items: &mut [QueueItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.retry_attempts.cmp(&b.retry_attempts))
            .then(a.start_time_ms.cmp(&b.start_time_ms))
    });
}
