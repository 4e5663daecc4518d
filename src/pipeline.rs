//! Streaming upload pipeline
//!
//! A three-stage dataflow per file: the source reads chunk payloads lazily
//! from disk, the transform stage validates/compresses on the worker pool and
//! encrypts when a key is bound, and the sink POSTs the result as
//! `multipart/form-data`. In-flight chunks are bounded by a semaphore whose
//! permit is acquired before the payload is read, so at most
//! `concurrent_streams` payloads are alive at once and a slow sink
//! backpressures the source. One cancellation token covers every await point.

use crate::chunk_cache::ChunkCache;
use crate::chunker::ChunkPlan;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::metrics::UploadMetrics;
use crate::models::{ChunkMetadata, ChunkSpec, FileInfo, LineChunk};
use crate::resources::{ResourceKind, ResourceTracker};
use crate::security::SecurityGate;
use crate::worker_pool::{TaskKind, TaskOutput, WorkerPool};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A chunk after the transform stage, ready for the sink
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub index: u32,
    pub total: u32,
    pub offset: u64,
    /// Pre-transform payload size; this is what counts toward uploaded bytes
    pub payload_size: u64,
    /// SHA-256 hex of the pre-encryption payload
    pub checksum: String,
    /// Wire bytes: possibly compressed, possibly `IV ‖ ciphertext`
    pub body: Bytes,
    pub compressed: bool,
}

/// What the sink needs to POST one chunk
#[derive(Debug, Clone)]
pub struct SinkRequest {
    pub metadata: ChunkMetadata,
    pub body: Bytes,
    /// Present iff resumability is enabled
    pub resume_token: Option<String>,
    /// Present iff checksum verification is enabled
    pub checksum: Option<String>,
}

/// Destination for prepared chunks
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, request: SinkRequest, cancel: &CancellationToken) -> Result<()>;
}

/// HTTP sink POSTing `multipart/form-data` to a fixed endpoint
pub struct HttpChunkSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChunkSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| UploadError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpChunkSink {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn build_form(request: &SinkRequest) -> Result<reqwest::multipart::Form> {
        let metadata_json = serde_json::to_string(&request.metadata)
            .map_err(|e| UploadError::Internal(format!("metadata encoding failed: {}", e)))?;

        let mut form = reqwest::multipart::Form::new()
            .part(
                "chunk",
                reqwest::multipart::Part::bytes(request.body.to_vec())
                    .file_name(format!(
                        "{}.part{}",
                        request.metadata.file_name, request.metadata.chunk_index
                    ))
                    .mime_str("application/octet-stream")
                    .map_err(|e| UploadError::Internal(e.to_string()))?,
            )
            .text("metadata", metadata_json);

        // The resumable variant duplicates the addressing fields so the
        // receiver can reassemble without parsing the metadata JSON.
        if let Some(token) = &request.resume_token {
            form = form
                .text("resumeToken", token.clone())
                .text("index", request.metadata.chunk_index.to_string())
                .text("total", request.metadata.total_chunks.to_string())
                .text("fileId", request.metadata.file_id.clone());
        }
        if let Some(checksum) = &request.checksum {
            form = form.text("checksum", checksum.clone());
        }

        Ok(form)
    }
}

#[async_trait]
impl ChunkSink for HttpChunkSink {
    async fn send_chunk(&self, request: SinkRequest, cancel: &CancellationToken) -> Result<()> {
        let form = Self::build_form(&request)?;
        let send = self.client.post(&self.endpoint).multipart(form).send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::from_http_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }
        Ok(())
    }
}

/// Consumer of prepared chunks; the upload manager's per-chunk retry wrapper
/// sits behind this seam.
#[async_trait]
pub trait ChunkDispatcher: Send + Sync {
    async fn dispatch(&self, chunk: PreparedChunk) -> Result<()>;
}

/// One scheduled unit of the plan
#[derive(Debug, Clone)]
enum PlanItem {
    Spec(ChunkSpec),
    Lines(LineChunk),
}

impl PlanItem {
    fn index(&self) -> u32 {
        match self {
            PlanItem::Spec(spec) => spec.index,
            PlanItem::Lines(chunk) => chunk.index,
        }
    }
}

/// The per-file dataflow engine
#[derive(Clone)]
pub struct UploadPipeline {
    config: Arc<UploadConfig>,
    workers: Arc<WorkerPool>,
    security: Arc<SecurityGate>,
    resources: Arc<ResourceTracker>,
    cache: Arc<ChunkCache>,
    metrics: Arc<UploadMetrics>,
}

impl UploadPipeline {
    pub fn new(
        config: Arc<UploadConfig>,
        workers: Arc<WorkerPool>,
        security: Arc<SecurityGate>,
        resources: Arc<ResourceTracker>,
        cache: Arc<ChunkCache>,
        metrics: Arc<UploadMetrics>,
    ) -> Self {
        UploadPipeline {
            config,
            workers,
            security,
            resources,
            cache,
            metrics,
        }
    }

    /// Drive the dataflow for the selected chunk indices.
    ///
    /// Submission order at the dispatcher is not guaranteed. The first fatal
    /// dispatcher error cancels the remaining work; the error returned is the
    /// first non-cancellation failure when one exists.
    pub async fn run(
        &self,
        file: &FileInfo,
        plan: &ChunkPlan,
        indices: &[u32],
        dispatcher: Arc<dyn ChunkDispatcher>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let items = select_items(plan, indices)?;
        if items.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_streams));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for item in items {
            let pipeline = self.clone();
            let file = file.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                // Backpressure: hold a permit for the chunk's whole lifetime,
                // acquired before the payload exists in memory.
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| UploadError::Cancelled)?
                    }
                };

                let prepared = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    prepared = pipeline.prepare_chunk(&file, &item) => prepared?,
                };

                let _charge = pipeline.resources.track(
                    ResourceKind::Chunk,
                    prepared.body.len() as u64,
                    HashMap::from([
                        ("file_id".to_string(), file.id.as_str().to_string()),
                        ("chunk".to_string(), prepared.index.to_string()),
                    ]),
                )?;

                dispatcher.dispatch(prepared).await
            });
        }

        let mut first_error: Option<UploadError> = None;
        let mut saw_cancel = false;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(UploadError::Internal(format!(
                    "pipeline task panicked: {}",
                    join_err
                ))),
            };

            match outcome {
                Ok(()) => {}
                Err(UploadError::Cancelled) => saw_cancel = true,
                Err(err) => {
                    if first_error.is_none() {
                        warn!("chunk failed, cancelling pipeline: {}", err);
                        first_error = Some(err);
                        cancel.cancel();
                    }
                }
            }
        }

        if let Some(err) = first_error {
            Err(err)
        } else if saw_cancel {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Source + transform for one chunk: materialize the payload, validate or
    /// hash it on the worker pool, compress past the gate, and encrypt when a
    /// key is bound to the file.
    async fn prepare_chunk(&self, file: &FileInfo, item: &PlanItem) -> Result<PreparedChunk> {
        let (payload, total, offset) = match item {
            PlanItem::Spec(spec) => {
                let payload = self.read_binary_payload(file, spec).await?;
                (payload, spec.total, spec.offset)
            }
            PlanItem::Lines(chunk) => {
                let encoded = serde_json::to_vec(&chunk.rows).map_err(|e| {
                    UploadError::Chunking(format!("row encoding failed: {}", e))
                })?;
                (Bytes::from(encoded), chunk.total, 0)
            }
        };
        let payload_size = payload.len() as u64;

        // Validation doubles as the checksum pass; both run off-loop
        let checksum = if self.config.validate_chunks {
            let expected = match item {
                PlanItem::Spec(spec) => Some(spec.size),
                PlanItem::Lines(_) => Some(payload_size),
            };
            match self
                .workers
                .submit(TaskKind::Validate, payload.clone(), expected)
                .await?
            {
                TaskOutput::Validated { checksum } => checksum,
                other => {
                    return Err(UploadError::Internal(format!(
                        "unexpected worker output: {:?}",
                        other
                    )))
                }
            }
        } else {
            match self
                .workers
                .submit(TaskKind::Hash, payload.clone(), None)
                .await?
            {
                TaskOutput::Hash(checksum) => checksum,
                other => {
                    return Err(UploadError::Internal(format!(
                        "unexpected worker output: {:?}",
                        other
                    )))
                }
            }
        };

        let (mut body, compressed) = if self.config.compression_enabled
            && crate::compressor::Compressor::should_compress(payload.len())
        {
            match self
                .workers
                .submit(TaskKind::Compress, payload.clone(), None)
                .await?
            {
                TaskOutput::Compressed(out) => {
                    if out.compressed {
                        self.metrics.record_compression_saving(
                            out.stats.original_size.saturating_sub(out.stats.compressed_size)
                                as u64,
                        );
                    }
                    (out.data, out.compressed)
                }
                other => {
                    return Err(UploadError::Internal(format!(
                        "unexpected worker output: {:?}",
                        other
                    )))
                }
            }
        } else {
            (payload, false)
        };

        if self.security.has_encryption_key(file.id.as_str()) {
            body = self.security.encrypt_chunk(file.id.as_str(), &body)?;
        }

        debug!(
            "prepared chunk {} of {} ({} -> {} bytes{})",
            item.index(),
            total,
            payload_size,
            body.len(),
            if compressed { ", compressed" } else { "" }
        );

        Ok(PreparedChunk {
            index: item.index(),
            total,
            offset,
            payload_size,
            checksum,
            body,
            compressed,
        })
    }

    /// Read one byte range, consulting the chunk cache first
    async fn read_binary_payload(&self, file: &FileInfo, spec: &ChunkSpec) -> Result<Bytes> {
        if let Some(cached) = self.cache.get(file, spec.index) {
            self.metrics.record_cache_hit();
            // A corrupt cache entry was already evicted inside get(); anything
            // returned here passed the digest check.
            if cached.len() as u64 == spec.size {
                return Ok(cached);
            }
            warn!("cached chunk {} has stale size, re-reading", spec.index);
        } else {
            self.metrics.record_cache_miss();
        }

        let mut handle = tokio::fs::File::open(&file.path).await.map_err(|e| {
            UploadError::IoError(format!("failed to open {}: {}", file.path.display(), e))
        })?;
        handle
            .seek(std::io::SeekFrom::Start(spec.offset))
            .await
            .map_err(|e| UploadError::IoError(format!("seek failed: {}", e)))?;

        let mut buf = vec![0u8; spec.size as usize];
        handle
            .read_exact(&mut buf)
            .await
            .map_err(|e| UploadError::IoError(format!("chunk read failed: {}", e)))?;

        let payload = Bytes::from(buf);
        self.cache.put(file, spec.index, &payload);
        Ok(payload)
    }
}

fn select_items(plan: &ChunkPlan, indices: &[u32]) -> Result<Vec<PlanItem>> {
    match plan {
        ChunkPlan::Binary(specs) => indices
            .iter()
            .map(|&i| {
                specs
                    .get(i as usize)
                    .copied()
                    .map(PlanItem::Spec)
                    .ok_or_else(|| {
                        UploadError::Chunking(format!("chunk index {} outside the plan", i))
                    })
            })
            .collect(),
        ChunkPlan::Lines(chunks) => indices
            .iter()
            .map(|&i| {
                chunks
                    .get(i as usize)
                    .cloned()
                    .map(PlanItem::Lines)
                    .ok_or_else(|| {
                        UploadError::Chunking(format!("chunk index {} outside the plan", i))
                    })
            })
            .collect(),
    }
}
