//! Core data models for the upload engine

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque unique identifier assigned when the engine first sees a file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    /// Mint a fresh identifier
    pub fn new() -> Self {
        FileId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local file submitted for upload
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Engine-assigned identity
    pub id: FileId,
    /// Base file name (no directory components)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Declared MIME type
    pub mime_type: String,
    /// Last-modified time in epoch milliseconds
    pub last_modified_ms: u64,
    /// Where chunk payloads are read from
    pub path: PathBuf,
}

impl FileInfo {
    /// Build a `FileInfo` from a path on disk, reading size and mtime from
    /// filesystem metadata.
    pub fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::Validation(format!("invalid file name: {:?}", path)))?
            .to_string();
        let last_modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(FileInfo {
            id: FileId::new(),
            name,
            size: meta.len(),
            mime_type: mime_type.into(),
            last_modified_ms,
            path: path.to_path_buf(),
        })
    }

    /// Cache identity for this file: name, size and mtime together
    pub fn cache_key(&self) -> String {
        format!("{}-{}-{}", self.name, self.size, self.last_modified_ms)
    }
}

/// Descriptor for one size-mode chunk.
///
/// The payload is not materialized here; the pipeline source reads the byte
/// range `[offset, offset + size)` lazily when the chunk is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Zero-based position in the chunk sequence
    pub index: u32,
    /// Number of chunks for this file
    pub total: u32,
    /// Byte offset of the first byte of this chunk
    pub offset: u64,
    /// Number of bytes covered
    pub size: u64,
}

impl ChunkSpec {
    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// One line-mode chunk: a group of parsed rows.
///
/// `total` is final on every chunk the chunker returns; line-mode parsing is
/// eager per file, so no consumer ever observes a provisional count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineChunk {
    pub index: u32,
    pub total: u32,
    pub rows: Vec<Vec<String>>,
}

/// Status of a single file's upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initialized,
    Uploading,
    Paused,
    Interrupted,
    Completed,
    Error,
}

impl UploadStatus {
    /// True for states an upload can be resumed from
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            UploadStatus::Initialized
                | UploadStatus::Uploading
                | UploadStatus::Paused
                | UploadStatus::Interrupted
        )
    }

    /// True once the upload can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }
}

/// Persisted per-chunk attempt record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkState {
    pub index: u32,
    pub size: u64,
    pub offset: u64,
    /// SHA-256 hex of the pre-encryption chunk payload
    pub checksum: String,
    pub attempts: u32,
    pub last_attempt_epoch_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted per-file upload state.
///
/// Serialized as UTF-8 JSON under the key `upload_state_{fileId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    pub start_time_ms: u64,
    pub last_update_ms: u64,
    pub bytes_uploaded: u64,
    pub status: UploadStatus,
    /// Opaque identifier the server uses to correlate resumed sessions
    pub resume_token: String,
    /// Whole-file SHA-256 hex, computed once at initialization
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadState {
    /// Create the initial state for a file, minting a fresh resume token
    pub fn new(file: &FileInfo, total_chunks: u32, checksum: String) -> Self {
        let now = epoch_ms();
        UploadState {
            file_id: file.id.as_str().to_string(),
            file_name: file.name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            start_time_ms: now,
            last_update_ms: now,
            bytes_uploaded: 0,
            status: UploadStatus::Initialized,
            resume_token: uuid::Uuid::new_v4().to_string(),
            checksum,
            error: None,
        }
    }

    /// Indices not yet acknowledged by the sink, in ascending order
    pub fn remaining_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    /// Record a successfully uploaded chunk.
    ///
    /// Idempotent: re-recording an already-uploaded index does not double
    /// count its bytes. Transitions to `Completed` once every index is in.
    pub fn record_chunk(&mut self, index: u32, size: u64) {
        if self.uploaded_chunks.insert(index) {
            self.bytes_uploaded += size;
        }
        self.last_update_ms = epoch_ms();
        if self.is_complete() {
            self.status = UploadStatus::Completed;
        }
    }

    /// True iff every chunk index has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u32 == self.total_chunks
    }

    /// Set a terminal or transitional status, touching the update timestamp
    pub fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
        self.last_update_ms = epoch_ms();
    }
}

/// Status of an entry in the upload queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Error,
}

/// One entry in the upload queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub file_id: String,
    /// Higher values are scheduled first
    pub priority: i32,
    pub status: QueueItemStatus,
    pub retry_attempts: u32,
    /// When the item entered the queue, epoch milliseconds
    pub start_time_ms: u64,
    pub stats: UploadStats,
}

/// Aggregate statistics for one upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub start_time_ms: u64,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
    /// Instantaneous bytes/sec
    pub speed: f64,
    /// Bytes/sec averaged over the whole transfer
    pub average_speed: f64,
    /// Estimated seconds until completion, if computable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining_secs: Option<f64>,
    pub retry_count: u32,
}

/// Snapshot passed to progress callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    /// Bytes/sec since the upload started
    pub speed: f64,
    /// Estimated seconds remaining; `None` while speed is zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_secs: Option<f64>,
}

/// Kind of progress event for out-of-process transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressEventType {
    Progress,
    Complete,
    Error,
    Queued,
}

/// Wire-serializable progress event.
///
/// The core emits these through callbacks; pushing them over a WebSocket or
/// any other transport is an adapter concern outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub file_id: String,
    /// Percentage complete, 0.0 to 100.0
    pub progress: f64,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<f64>,
}

/// Metadata posted alongside every chunk as the `metadata` multipart field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
}
