//! Resumable upload orchestration
//!
//! [`UploadEngine`] owns the shared singletons (security gate, state store,
//! resource tracker, error classifier, metrics, chunk cache, worker pool) and
//! drives one cancellable pipeline per file. The per-chunk retry wrapper
//! lives here: it records chunk attempts, consults the classifier on failure,
//! and updates the persisted state after every acknowledged chunk.

use crate::chunk_cache::ChunkCache;
use crate::chunker::Chunker;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::metrics::UploadMetrics;
use crate::models::{
    epoch_ms, ChunkMetadata, ChunkState, FileInfo, ProgressEvent, ProgressEventType,
    UploadProgress, UploadState, UploadStatus,
};
use crate::pipeline::{
    ChunkDispatcher, ChunkSink, HttpChunkSink, PreparedChunk, SinkRequest, UploadPipeline,
};
use crate::queue::UploadQueue;
use crate::resources::ResourceTracker;
use crate::retry::{ErrorClassifier, ErrorContext};
use crate::security::SecurityGate;
use crate::state_store::StateStore;
use crate::worker_pool::WorkerPool;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between progress callbacks for one file
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Callback invoked with throttled progress snapshots
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Everything needed to start (or resume) one upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: FileInfo,
    pub endpoint: String,
    pub user_id: String,
    /// Required when access control is enabled
    pub access_token: Option<String>,
}

struct ActiveUpload {
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
}

/// Top-level upload engine
pub struct UploadEngine {
    config: Arc<UploadConfig>,
    security: Arc<SecurityGate>,
    store: Arc<StateStore>,
    resources: Arc<ResourceTracker>,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<UploadMetrics>,
    cache: Arc<ChunkCache>,
    workers: Arc<WorkerPool>,
    queue: Arc<UploadQueue>,
    active: StdMutex<HashMap<String, ActiveUpload>>,
    events: broadcast::Sender<ProgressEvent>,
    maintenance_started: AtomicBool,
}

impl UploadEngine {
    /// Build an engine from a validated configuration
    pub fn new(config: UploadConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(StateStore::from_config(&config.resumable)?);
        let security = Arc::new(SecurityGate::new(config.security.clone()));
        let resources = Arc::new(ResourceTracker::new(&config.memory));
        let classifier = Arc::new(ErrorClassifier::for_upload_config(&config.resumable));
        let metrics = Arc::new(UploadMetrics::new());
        let cache = Arc::new(ChunkCache::new(&config.cache));
        let workers = Arc::new(WorkerPool::new(&config.worker, config.retry_attempts));
        let queue = Arc::new(UploadQueue::new(
            config.security.rate_limit.max_concurrent_uploads as usize,
        ));
        let (events, _) = broadcast::channel(256);

        Ok(Arc::new(UploadEngine {
            config,
            security,
            store,
            resources,
            classifier,
            metrics,
            cache,
            workers,
            queue,
            active: StdMutex::new(HashMap::new()),
            events,
            maintenance_started: AtomicBool::new(false),
        }))
    }

    /// Autosave, memory checks and token sweeping; started once, lazily,
    /// from inside the runtime.
    fn ensure_maintenance(self: &Arc<Self>) {
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.resumable.enabled {
            self.store.start_autosave(Duration::from_secs(
                self.config.resumable.auto_save_interval_secs,
            ));
        }
        self.resources.start_auto_cleanup();
        self.security.start_token_sweeper();
    }

    /// Upload one file to the endpoint, resuming from persisted state when
    /// any exists.
    ///
    /// Rejects a file that is already live, a user past the rate limit, an
    /// invalid access token, and any file validation failure. The returned
    /// state is terminal (`Completed`); pausing or cancelling surfaces as
    /// `UploadError::Cancelled`.
    pub async fn start_upload(
        self: &Arc<Self>,
        request: &UploadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<UploadState> {
        self.ensure_maintenance();
        let file = &request.file;
        let file_id = file.id.as_str().to_string();

        if self.active.lock().unwrap().contains_key(&file_id) {
            return Err(UploadError::Validation(format!(
                "an upload for file {} is already in progress",
                file_id
            )));
        }

        if self.config.security.access_control.enabled {
            let valid = request
                .access_token
                .as_deref()
                .map(|t| self.security.validate_token(t))
                .unwrap_or(false);
            if !valid {
                return Err(UploadError::AccessDenied(
                    "missing or invalid access token".into(),
                ));
            }
        }

        self.security.check_rate_limit(&request.user_id)?;

        // Past this point the concurrency slot must be released on every exit
        let result = self
            .run_upload(request, on_progress)
            .await;
        self.security.release_rate_limit(&request.user_id);

        if let Err(err) = &result {
            if !matches!(err, UploadError::Cancelled) {
                self.classifier.handle_error(
                    err,
                    &ErrorContext {
                        file_id: file_id.clone(),
                        chunk_index: None,
                        retry_count: 0,
                        is_recoverable: false,
                    },
                );
            }
        }
        result
    }

    async fn run_upload(
        self: &Arc<Self>,
        request: &UploadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<UploadState> {
        let file = &request.file;
        let file_id = file.id.as_str().to_string();

        let validation = self.security.validate_file(file).await?;
        if !validation.is_valid {
            return Err(UploadError::Validation(validation.errors.join("; ")));
        }

        // Chunk planning may parse the whole file in lines mode
        let plan = {
            let chunker = Chunker::new(Arc::clone(&self.config));
            let file = file.clone();
            tokio::task::spawn_blocking(move || chunker.plan(&file))
                .await
                .map_err(|e| UploadError::Internal(format!("chunk planning failed: {}", e)))??
        };

        let (mut state, resumed) = match self.store.get_state(&file_id).await? {
            Some(existing) if existing.status.is_resumable() => (existing, true),
            Some(existing) if existing.status == UploadStatus::Completed => {
                debug!("file {} already completed, nothing to upload", file_id);
                return Ok(existing);
            }
            _ => (
                self.store
                    .initialize_state(file, plan.total_chunks())
                    .await?,
                false,
            ),
        };

        let progress = Arc::new(ProgressReporter::new(
            on_progress,
            self.events.clone(),
            file_id.clone(),
            file.size,
        ));

        // Empty file: nothing to post, complete immediately
        if plan.is_empty() {
            state.set_status(UploadStatus::Completed);
            self.store.save_state(&state).await?;
            self.metrics.record_upload_started(resumed);
            self.metrics.record_upload_finished(true);
            progress.report(0, true);
            progress.emit_event(ProgressEventType::Complete, UploadStatus::Completed, None);
            return Ok(state);
        }

        let remaining = state.remaining_chunks();
        info!(
            "starting upload of {} ({} of {} chunks remaining{})",
            file.name,
            remaining.len(),
            state.total_chunks,
            if resumed { ", resumed" } else { "" }
        );

        self.security.create_encryption_key(&file_id)?;

        state.set_status(UploadStatus::Uploading);
        self.store.save_state(&state).await?;
        self.metrics.record_upload_started(resumed);
        progress.report(state.bytes_uploaded, true);

        let cancel = CancellationToken::new();
        let pause_requested = Arc::new(AtomicBool::new(false));
        self.active.lock().unwrap().insert(
            file_id.clone(),
            ActiveUpload {
                cancel: cancel.clone(),
                pause_requested: Arc::clone(&pause_requested),
            },
        );

        let shared_state = Arc::new(Mutex::new(state));
        let sink: Arc<dyn ChunkSink> = Arc::new(HttpChunkSink::new(&request.endpoint)?);
        let dispatcher = Arc::new(ChunkUploadDispatcher {
            file: file.clone(),
            state: Arc::clone(&shared_state),
            store: Arc::clone(&self.store),
            classifier: Arc::clone(&self.classifier),
            metrics: Arc::clone(&self.metrics),
            sink,
            resumable_enabled: self.config.resumable.enabled,
            checksum_verification: self.config.resumable.checksum_verification,
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
        });

        let pipeline = UploadPipeline::new(
            Arc::clone(&self.config),
            Arc::clone(&self.workers),
            Arc::clone(&self.security),
            Arc::clone(&self.resources),
            Arc::clone(&self.cache),
            Arc::clone(&self.metrics),
        );

        let run_result = pipeline
            .run(file, &plan, &remaining, dispatcher, cancel.clone())
            .await;

        self.active.lock().unwrap().remove(&file_id);

        let mut state = shared_state.lock().await.clone();
        match run_result {
            Ok(()) => {
                state.set_status(UploadStatus::Completed);
                state.error = None;
                self.store.save_state(&state).await?;
                self.security.destroy_encryption_key(&file_id);
                self.metrics.record_upload_finished(true);
                progress.report(state.bytes_uploaded, true);
                progress.emit_event(ProgressEventType::Complete, UploadStatus::Completed, None);
                info!("upload of {} completed", file.name);
                Ok(state)
            }
            Err(UploadError::Cancelled) if pause_requested.load(Ordering::SeqCst) => {
                state.set_status(UploadStatus::Paused);
                self.store.save_state(&state).await?;
                progress.emit_event(ProgressEventType::Progress, UploadStatus::Paused, None);
                info!("upload of {} paused", file.name);
                Err(UploadError::Cancelled)
            }
            Err(err) => {
                let status = if matches!(err, UploadError::Cancelled) {
                    // Cancelled without a pause request: preserve for resume
                    UploadStatus::Interrupted
                } else {
                    UploadStatus::Error
                };
                state.set_status(status);
                state.error = Some(err.to_string());
                if let Err(save_err) = self.store.save_state(&state).await {
                    warn!("failed to persist terminal state: {}", save_err);
                }
                self.security.destroy_encryption_key(&file_id);
                self.metrics.record_upload_finished(false);
                progress.emit_event(
                    ProgressEventType::Error,
                    status,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Abort the pipeline and persist `Paused` for later resume
    pub async fn pause_upload(&self, file_id: &str) -> Result<()> {
        let active = self.active.lock().unwrap();
        let Some(upload) = active.get(file_id) else {
            return Err(UploadError::Validation(format!(
                "no active upload for file {}",
                file_id
            )));
        };
        upload.pause_requested.store(true, Ordering::SeqCst);
        upload.cancel.cancel();
        Ok(())
    }

    /// Resume a paused or interrupted upload; rejected unless the persisted
    /// state permits it.
    pub async fn resume_upload(
        self: &Arc<Self>,
        request: &UploadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<UploadState> {
        let file_id = request.file.id.as_str();
        if !self.store.can_resume(file_id).await {
            return Err(UploadError::Validation(format!(
                "file {} has no resumable state",
                file_id
            )));
        }
        self.start_upload(request, on_progress).await
    }

    /// Abort if live, then forget every trace of the file's state
    pub async fn cancel_upload(&self, file_id: &str) -> Result<()> {
        let was_active = {
            let active = self.active.lock().unwrap();
            if let Some(upload) = active.get(file_id) {
                upload.cancel.cancel();
                true
            } else {
                false
            }
        };

        if was_active {
            // Give the driving task a bounded window to unwind
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if !self.active.lock().unwrap().contains_key(file_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        self.security.destroy_encryption_key(file_id);
        self.store.remove_state(file_id).await?;
        info!("upload {} cancelled and forgotten", file_id);
        Ok(())
    }

    /// True while a pipeline is live for this file
    pub fn is_active(&self, file_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(file_id)
    }

    /// Progress/completion/error events for out-of-process transports
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<UploadMetrics> {
        &self.metrics
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn security(&self) -> &Arc<SecurityGate> {
        &self.security
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<UploadConfig> {
        &self.config
    }

    /// Stop background tasks and the worker pool. Live uploads are aborted.
    pub async fn shutdown(&self) {
        let uploads: Vec<CancellationToken> = self
            .active
            .lock()
            .unwrap()
            .values()
            .map(|u| u.cancel.clone())
            .collect();
        for cancel in uploads {
            cancel.cancel();
        }

        self.store.stop_autosave();
        self.resources.stop_auto_cleanup();
        self.security.stop_token_sweeper();
        self.workers.shutdown().await;
    }
}

/// Throttled, monotonic progress emission for one file
pub(crate) struct ProgressReporter {
    callback: Option<ProgressCallback>,
    events: broadcast::Sender<ProgressEvent>,
    file_id: String,
    total_bytes: u64,
    started: Instant,
    last_emit: StdMutex<Option<Instant>>,
    highest_reported: AtomicU64,
}

impl ProgressReporter {
    fn new(
        callback: Option<ProgressCallback>,
        events: broadcast::Sender<ProgressEvent>,
        file_id: String,
        total_bytes: u64,
    ) -> Self {
        ProgressReporter {
            callback,
            events,
            file_id,
            total_bytes,
            started: Instant::now(),
            last_emit: StdMutex::new(None),
            highest_reported: AtomicU64::new(0),
        }
    }

    /// Emit a progress callback, at most once per 100ms unless forced.
    ///
    /// Reported `bytes_uploaded` is monotonically non-decreasing: a stale
    /// value loses the race against `fetch_max` and is dropped.
    pub(crate) fn report(&self, bytes_uploaded: u64, force: bool) {
        let prev = self
            .highest_reported
            .fetch_max(bytes_uploaded, Ordering::SeqCst);
        if bytes_uploaded < prev {
            return;
        }

        {
            let mut last = self.last_emit.lock().unwrap();
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < PROGRESS_MIN_INTERVAL {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            bytes_uploaded as f64 / elapsed
        } else {
            0.0
        };
        let estimated_time_remaining_secs = if speed > 0.0 {
            Some((self.total_bytes.saturating_sub(bytes_uploaded)) as f64 / speed)
        } else {
            None
        };

        let progress = UploadProgress {
            bytes_uploaded,
            total_bytes: self.total_bytes,
            speed,
            estimated_time_remaining_secs,
        };

        if let Some(callback) = &self.callback {
            callback(progress.clone());
        }

        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            (bytes_uploaded as f64 / self.total_bytes as f64) * 100.0
        };
        let _ = self.events.send(ProgressEvent {
            event_type: ProgressEventType::Progress,
            file_id: self.file_id.clone(),
            progress: percent,
            status: UploadStatus::Uploading,
            error: None,
            queue_position: None,
            estimated_time_remaining_secs: progress.estimated_time_remaining_secs,
            upload_speed: Some(progress.speed),
        });
    }

    fn emit_event(
        &self,
        event_type: ProgressEventType,
        status: UploadStatus,
        error: Option<String>,
    ) {
        let bytes = self.highest_reported.load(Ordering::SeqCst);
        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            (bytes as f64 / self.total_bytes as f64) * 100.0
        };
        let _ = self.events.send(ProgressEvent {
            event_type,
            file_id: self.file_id.clone(),
            progress: percent,
            status,
            error,
            queue_position: None,
            estimated_time_remaining_secs: None,
            upload_speed: None,
        });
    }
}

/// The per-chunk retry wrapper.
///
/// Records a `ChunkState` before each attempt, performs the POST, updates the
/// shared `UploadState` on success, and on failure defers entirely to the
/// error classifier for the stop/retry decision (the classifier, not this
/// loop, owns the attempt budget).
struct ChunkUploadDispatcher {
    file: FileInfo,
    state: Arc<Mutex<UploadState>>,
    store: Arc<StateStore>,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<UploadMetrics>,
    sink: Arc<dyn ChunkSink>,
    resumable_enabled: bool,
    checksum_verification: bool,
    progress: Arc<ProgressReporter>,
    cancel: CancellationToken,
}

#[async_trait]
impl ChunkDispatcher for ChunkUploadDispatcher {
    async fn dispatch(&self, chunk: PreparedChunk) -> Result<()> {
        let file_id = self.file.id.as_str();
        let prior_attempts = self
            .store
            .get_chunk_state(file_id, chunk.index)
            .await
            .ok()
            .flatten()
            .map(|c| c.attempts)
            .unwrap_or(0);

        let resume_token = {
            let state = self.state.lock().await;
            state.resume_token.clone()
        };

        let mut retries: u32 = 0;
        loop {
            let attempts = prior_attempts + retries + 1;
            let record = ChunkState {
                index: chunk.index,
                size: chunk.payload_size,
                offset: chunk.offset,
                checksum: chunk.checksum.clone(),
                attempts,
                last_attempt_epoch_ms: epoch_ms(),
                error: None,
            };
            if let Err(e) = self.store.save_chunk_state(file_id, &record).await {
                warn!("failed to record chunk {} attempt: {}", chunk.index, e);
            }

            let request = SinkRequest {
                metadata: ChunkMetadata {
                    file_id: file_id.to_string(),
                    file_name: self.file.name.clone(),
                    file_size: self.file.size,
                    mime_type: self.file.mime_type.clone(),
                    chunk_index: chunk.index,
                    total_chunks: chunk.total,
                },
                body: chunk.body.clone(),
                resume_token: self.resumable_enabled.then(|| resume_token.clone()),
                checksum: (self.resumable_enabled && self.checksum_verification)
                    .then(|| chunk.checksum.clone()),
            };

            let started = Instant::now();
            let result = self.sink.send_chunk(request, &self.cancel).await;
            self.metrics.record_chunk_duration(started.elapsed());

            match result {
                Ok(()) => {
                    self.metrics.record_chunk(true);
                    self.metrics.record_bytes_uploaded(chunk.payload_size);

                    let snapshot = {
                        let mut state = self.state.lock().await;
                        state.record_chunk(chunk.index, chunk.payload_size);
                        if !state.is_complete() {
                            state.status = UploadStatus::Uploading;
                        }
                        state.clone()
                    };
                    self.store.save_state(&snapshot).await?;
                    self.progress.report(snapshot.bytes_uploaded, false);
                    return Ok(());
                }
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(err) => {
                    self.metrics.record_chunk(false);

                    let failed = ChunkState {
                        error: Some(err.to_string()),
                        last_attempt_epoch_ms: epoch_ms(),
                        ..record
                    };
                    if let Err(e) = self.store.save_chunk_state(file_id, &failed).await {
                        warn!("failed to record chunk {} failure: {}", chunk.index, e);
                    }

                    let decision = self.classifier.handle_error(
                        &err,
                        &ErrorContext {
                            file_id: file_id.to_string(),
                            chunk_index: Some(chunk.index),
                            retry_count: retries,
                            is_recoverable: err.is_transient(),
                        },
                    );

                    if !decision.should_retry {
                        return Err(err);
                    }

                    debug!(
                        "retrying chunk {} after {:?} ({})",
                        chunk.index, decision.delay, err
                    );
                    self.metrics.record_chunk_retry();
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(decision.delay) => {}
                    }
                    retries += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_monotonic_guard() {
        let (events, _) = broadcast::channel(16);
        let reporter = ProgressReporter::new(None, events, "f".into(), 100);

        reporter.report(50, true);
        // A stale lower value never lowers the high-water mark
        reporter.report(20, true);
        assert_eq!(reporter.highest_reported.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_progress_throttling() {
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let callback: ProgressCallback = Arc::new(move |p: UploadProgress| {
            sink.lock().unwrap().push(p.bytes_uploaded);
        });

        let (events, _) = broadcast::channel(16);
        let reporter = ProgressReporter::new(Some(callback), events, "f".into(), 100);

        reporter.report(10, true);
        // Inside the 100ms window, dropped
        reporter.report(20, false);
        reporter.report(30, false);
        // Forced, emitted
        reporter.report(40, true);

        assert_eq!(*emitted.lock().unwrap(), vec![10, 40]);
    }

    #[test]
    fn test_progress_speed_and_eta_guarded() {
        let (events, _) = broadcast::channel(16);
        let reporter = ProgressReporter::new(None, events.clone(), "f".into(), 100);

        // Zero bytes uploaded: no ETA, no division by zero
        let mut rx = events.subscribe();
        reporter.report(0, true);
        let event = rx.try_recv().unwrap();
        assert!(event.estimated_time_remaining_secs.is_none());
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = UploadConfig::default();
        config.concurrent_streams = 0;
        assert!(UploadEngine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_pause_without_active_upload() {
        let engine = UploadEngine::new(UploadConfig::default()).unwrap();
        assert!(engine.pause_upload("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_resume_requires_resumable_state() {
        let engine = UploadEngine::new(UploadConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"data").unwrap();
        let request = UploadRequest {
            file: FileInfo::from_path(&path, "application/octet-stream").unwrap(),
            endpoint: "http://127.0.0.1:1/upload".into(),
            user_id: "alice".into(),
            access_token: None,
        };
        let result = engine.resume_upload(&request, None).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
    }
}
