//! chunkflow
//!
//! A client-side resumable chunked file upload engine. Given a large local
//! file and an HTTP sink endpoint, the engine partitions the file into
//! bounded chunks, optionally validates/compresses/encrypts them, uploads
//! them concurrently with retry and backoff, persists per-file progress so
//! interrupted transfers resume where they stopped, and surfaces detailed
//! progress and error telemetry.
//!
//! # Features
//!
//! - **Chunking**: size-based byte ranges or line-based groups for tabular
//!   formats (CSV, spreadsheets, plain text), selected per MIME type
//! - **Concurrent pipeline**: bounded-parallel read → transform → POST
//!   dataflow with backpressure and a single cancellation token
//! - **Resumability**: durable per-file state; a restart re-uploads only the
//!   chunks the sink never acknowledged
//! - **Retry with backoff**: per-error-kind strategies with immediate,
//!   linear, exponential and fibonacci delay curves
//! - **Security**: file validation (size, MIME, extension, magic bytes,
//!   executable-header scan), AES-GCM chunk encryption, sliding-window rate
//!   limiting, access-token lifecycle
//! - **Resource accounting**: a byte budget over in-flight payloads with
//!   threshold-driven cleanup
//! - **Queue scheduling**: priority ordering across files under a global
//!   concurrency cap
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chunkflow::{FileInfo, UploadConfig, UploadEngine, UploadRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = UploadEngine::new(UploadConfig::default())?;
//!
//! let request = UploadRequest {
//!     file: FileInfo::from_path("videos/talk.mp4", "video/mp4")?,
//!     endpoint: "https://uploads.example.com/chunks".to_string(),
//!     user_id: "alice".to_string(),
//!     access_token: None,
//! };
//!
//! let state = engine
//!     .start_upload(&request, Some(std::sync::Arc::new(|progress| {
//!         println!("{} / {} bytes", progress.bytes_uploaded, progress.total_bytes);
//!     })))
//!     .await?;
//!
//! println!("uploaded {} chunks", state.uploaded_chunks.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The engine is composed of small components wired together by
//! [`UploadEngine`]:
//!
//! - [`Chunker`]: splits a file into an ordered chunk sequence
//! - [`UploadPipeline`]: the bounded-parallel dataflow per file
//! - [`StateStore`]: durable upload/chunk state over a pluggable backend
//! - [`ErrorClassifier`]: maps errors to kinds and owns retry decisions
//! - [`SecurityGate`]: validation, encryption, rate limits and tokens
//! - [`ResourceTracker`]: the in-flight byte budget
//! - [`WorkerPool`]: CPU work (hash, compress, validate) off the async loop
//! - [`ChunkCache`]: bounded cache of recently produced chunk payloads
//! - [`UploadQueue`]: priority scheduling across files
//! - [`UploadMetrics`]: atomic counters with point-in-time snapshots
//!
//! # Wire protocol
//!
//! Each chunk is POSTed as `multipart/form-data` with a binary `chunk` field
//! and a JSON `metadata` field carrying `{fileId, fileName, fileSize,
//! mimeType, chunkIndex, totalChunks}`. When resumability is enabled the
//! request additionally carries `resumeToken`, a pre-encryption SHA-256
//! `checksum`, and duplicated `index`/`total`/`fileId` fields. Any non-2xx
//! response is surfaced to the retry layer. Chunks may arrive out of order;
//! the receiver reassembles by `(fileId, chunkIndex)`.
//!
//! # Configuration
//!
//! Configuration is loaded from YAML (or built in code) with serde defaults
//! for every field:
//!
//! ```yaml
//! chunk_size: 1048576          # 1MB chunks
//! concurrent_streams: 4        # in-flight chunks per file
//! compression_enabled: true
//! security:
//!   max_file_size: 104857600   # 100MB
//!   allowed_mime_types: ["*"]
//!   rate_limit:
//!     max_requests_per_minute: 60
//!     max_concurrent_uploads: 3
//! resumable:
//!   storage_backend: file
//!   state_dir: .chunkflow-state
//! ```
//!
//! See [`UploadConfig`] for every recognized option and its effect.

pub mod chunk_cache;
pub mod chunker;
pub mod compressor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod sanitizer;
pub mod security;
pub mod state_store;
pub mod uploader;
pub mod worker_pool;

// Re-export commonly used types
pub use chunk_cache::{ChunkCache, ChunkCacheStats};
pub use chunker::{plan_size_chunks, ChunkPlan, Chunker};
pub use compressor::{CompressedChunk, CompressionStats, Compressor};
pub use config::{
    ChunkingMode, FileTypeConfig, ResumableConfig, SecurityConfig, UploadConfig,
};
pub use error::{ErrorKind, ErrorSeverity, Result, UploadError};
pub use metrics::{MetricsSnapshot, Stat, UploadMetrics};
pub use models::{
    ChunkMetadata, ChunkSpec, ChunkState, FileId, FileInfo, LineChunk, ProgressEvent,
    ProgressEventType, QueueItem, QueueItemStatus, UploadProgress, UploadState, UploadStats,
    UploadStatus,
};
pub use pipeline::{ChunkSink, HttpChunkSink, PreparedChunk, SinkRequest, UploadPipeline};
pub use queue::{QueueEvent, QueueEventKind, QueueStats, UploadQueue};
pub use resources::{ResourceGuard, ResourceKind, ResourceTracker, TrackerSnapshot};
pub use retry::{
    BackoffCurve, ErrorClassifier, ErrorContext, ErrorReport, RetryDecision, RetryStrategy,
};
pub use security::{FileValidation, SecurityGate};
pub use state_store::{FileBackend, MemoryBackend, StateBackend, StateStore};
pub use uploader::{ProgressCallback, UploadEngine, UploadRequest};
pub use worker_pool::{TaskKind, TaskOutput, WorkerPool};
