//! Durable persistence of upload and chunk state
//!
//! State lives behind a pluggable key/value backend with a write-through
//! in-memory cache. Keys follow the layout `upload_state_{fileId}` and
//! `chunk_state_{fileId}_{index}`; values are UTF-8 JSON.

use crate::error::{Result, UploadError};
use crate::models::{ChunkState, FileInfo, UploadState};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pluggable key/value persistence
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-process backend; state does not survive the process
#[derive(Default)]
pub struct MemoryBackend {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }
}

/// Durable backend: one JSON document per key under a directory.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never observes a partial document.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBackend { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are engine-generated; reject anything that could escape the dir
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(UploadError::Storage(format!("invalid state key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UploadError::Storage(format!("failed to create state dir: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| UploadError::Storage(format!("failed to write state: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| UploadError::Storage(format!("failed to commit state: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Storage(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => {
                return Err(UploadError::Storage(format!(
                    "failed to list state dir: {}",
                    e
                )))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?
        {
            let name = entry.file_name();
            if let Some(key) = name.to_string_lossy().strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

/// Upload state persistence with a write-through cache and autosave
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    cache: Mutex<HashMap<String, UploadState>>,
    autosave: Mutex<Option<JoinHandle<()>>>,
    autosave_cancel: CancellationToken,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        StateStore {
            backend,
            cache: Mutex::new(HashMap::new()),
            autosave: Mutex::new(None),
            autosave_cancel: CancellationToken::new(),
        }
    }

    /// Build the backend named by the resumable config
    pub fn from_config(config: &crate::config::ResumableConfig) -> Result<Self> {
        let backend: Arc<dyn StateBackend> = match config.storage_backend.as_str() {
            "memory" => Arc::new(MemoryBackend::new()),
            "file" => Arc::new(FileBackend::new(&config.state_dir)),
            other => {
                return Err(UploadError::Config(format!(
                    "unknown storage backend '{}'",
                    other
                )))
            }
        };
        Ok(StateStore::new(backend))
    }

    fn state_key(file_id: &str) -> String {
        format!("upload_state_{}", file_id)
    }

    fn chunk_key(file_id: &str, index: u32) -> String {
        format!("chunk_state_{}_{}", file_id, index)
    }

    /// Create and persist the initial state for a file.
    ///
    /// Computes the whole-file SHA-256 (streamed) and mints a fresh resume
    /// token.
    pub async fn initialize_state(
        &self,
        file: &FileInfo,
        total_chunks: u32,
    ) -> Result<UploadState> {
        let checksum = file_sha256(&file.path).await?;
        let state = UploadState::new(file, total_chunks, checksum);
        self.save_state(&state).await?;
        debug!(
            "initialized upload state for {} ({} chunks)",
            state.file_id, total_chunks
        );
        Ok(state)
    }

    /// Persist a state, updating the in-memory cache first.
    ///
    /// Each call is atomic with respect to readers: the cache entry is
    /// replaced whole, and the file backend renames a complete document.
    pub async fn save_state(&self, state: &UploadState) -> Result<()> {
        let key = Self::state_key(&state.file_id);
        self.cache
            .lock()
            .unwrap()
            .insert(state.file_id.clone(), state.clone());

        let json = serde_json::to_string(state)
            .map_err(|e| UploadError::Storage(format!("state serialization failed: {}", e)))?;
        self.backend.set(&key, &json).await
    }

    /// Fetch a state, preferring the in-memory cache
    pub async fn get_state(&self, file_id: &str) -> Result<Option<UploadState>> {
        if let Some(state) = self.cache.lock().unwrap().get(file_id) {
            return Ok(Some(state.clone()));
        }

        let key = Self::state_key(file_id);
        let Some(json) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let state: UploadState = serde_json::from_str(&json)
            .map_err(|e| UploadError::Storage(format!("state deserialization failed: {}", e)))?;

        self.cache
            .lock()
            .unwrap()
            .insert(file_id.to_string(), state.clone());
        Ok(Some(state))
    }

    /// Remove a file's state and all of its chunk records
    pub async fn remove_state(&self, file_id: &str) -> Result<()> {
        self.cache.lock().unwrap().remove(file_id);
        self.backend.remove(&Self::state_key(file_id)).await?;

        let chunk_prefix = format!("chunk_state_{}_", file_id);
        for key in self.backend.keys().await? {
            if key.starts_with(&chunk_prefix) {
                self.backend.remove(&key).await?;
            }
        }
        Ok(())
    }

    pub async fn save_chunk_state(&self, file_id: &str, chunk: &ChunkState) -> Result<()> {
        let json = serde_json::to_string(chunk)
            .map_err(|e| UploadError::Storage(format!("chunk serialization failed: {}", e)))?;
        self.backend
            .set(&Self::chunk_key(file_id, chunk.index), &json)
            .await
    }

    pub async fn get_chunk_state(&self, file_id: &str, index: u32) -> Result<Option<ChunkState>> {
        let Some(json) = self.backend.get(&Self::chunk_key(file_id, index)).await? else {
            return Ok(None);
        };
        let chunk: ChunkState = serde_json::from_str(&json)
            .map_err(|e| UploadError::Storage(format!("chunk deserialization failed: {}", e)))?;
        Ok(Some(chunk))
    }

    /// True iff a state exists whose status permits resuming
    pub async fn can_resume(&self, file_id: &str) -> bool {
        match self.get_state(file_id).await {
            Ok(Some(state)) => state.status.is_resumable(),
            _ => false,
        }
    }

    /// Chunk indices still owed to the sink: `{0..total} \ uploaded`
    pub async fn resumable_chunks(&self, file_id: &str) -> Result<Vec<u32>> {
        let state = self
            .get_state(file_id)
            .await?
            .ok_or_else(|| UploadError::Storage(format!("no state for file {}", file_id)))?;
        Ok(state.remaining_chunks())
    }

    /// Flush every cached state to the backend. Returns how many saves
    /// failed; failures are logged and never propagate.
    pub async fn flush(&self) -> usize {
        let states: Vec<UploadState> = self.cache.lock().unwrap().values().cloned().collect();
        let mut failures = 0;
        for state in states {
            let key = Self::state_key(&state.file_id);
            match serde_json::to_string(&state) {
                Ok(json) => {
                    if let Err(e) = self.backend.set(&key, &json).await {
                        warn!("autosave failed for {}: {}", state.file_id, e);
                        failures += 1;
                    }
                }
                Err(e) => {
                    warn!("autosave serialization failed for {}: {}", state.file_id, e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Start the autosave loop, flushing all cached states every `interval`
    pub fn start_autosave(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.autosave.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let store = Arc::clone(self);
        let cancel = self.autosave_cancel.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.flush().await;
                    }
                }
            }
        }));
    }

    /// Stop the autosave loop
    pub fn stop_autosave(&self) {
        self.autosave_cancel.cancel();
        if let Some(handle) = self.autosave.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.autosave_cancel.cancel();
    }
}

/// Streamed SHA-256 of a whole file, hex-encoded
pub async fn file_sha256(path: &std::path::Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UploadError::IoError(format!("failed to open {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileId, UploadStatus};

    fn test_file(dir: &std::path::Path, contents: &[u8]) -> FileInfo {
        let path = dir.join("data.bin");
        std::fs::write(&path, contents).unwrap();
        FileInfo {
            id: FileId::new(),
            name: "data.bin".into(),
            size: contents.len() as u64,
            mime_type: "application/octet-stream".into(),
            last_modified_ms: 0,
            path,
        }
    }

    #[tokio::test]
    async fn test_initialize_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let file = test_file(dir.path(), b"hello world");

        let state = store.initialize_state(&file, 3).await.unwrap();
        assert_eq!(state.status, UploadStatus::Initialized);
        assert!(!state.resume_token.is_empty());
        assert!(!state.checksum.is_empty());

        let loaded = store.get_state(file.id.as_str()).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_get_state_falls_back_to_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let file = test_file(dir.path(), b"payload");

        // Populate through one store, read through a second with a cold cache
        let store1 = StateStore::new(backend.clone());
        let state = store1.initialize_state(&file, 2).await.unwrap();

        let store2 = StateStore::new(backend);
        let loaded = store2.get_state(file.id.as_str()).await.unwrap().unwrap();
        assert_eq!(loaded.resume_token, state.resume_token);
    }

    #[tokio::test]
    async fn test_resumable_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let file = test_file(dir.path(), &[0u8; 100]);

        let mut state = store.initialize_state(&file, 4).await.unwrap();
        state.record_chunk(0, 25);
        state.record_chunk(2, 25);
        store.save_state(&state).await.unwrap();

        let remaining = store.resumable_chunks(file.id.as_str()).await.unwrap();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_can_resume_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let file = test_file(dir.path(), b"x");

        let mut state = store.initialize_state(&file, 1).await.unwrap();
        assert!(store.can_resume(file.id.as_str()).await);

        state.set_status(UploadStatus::Paused);
        store.save_state(&state).await.unwrap();
        assert!(store.can_resume(file.id.as_str()).await);

        state.set_status(UploadStatus::Completed);
        store.save_state(&state).await.unwrap();
        assert!(!store.can_resume(file.id.as_str()).await);

        assert!(!store.can_resume("missing-file").await);
    }

    #[tokio::test]
    async fn test_chunk_state_round_trip() {
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let chunk = ChunkState {
            index: 2,
            size: 1024,
            offset: 2048,
            checksum: "deadbeef".into(),
            attempts: 1,
            last_attempt_epoch_ms: 12345,
            error: None,
        };

        store.save_chunk_state("file-1", &chunk).await.unwrap();
        let loaded = store.get_chunk_state("file-1", 2).await.unwrap().unwrap();
        assert_eq!(loaded, chunk);
        assert!(store.get_chunk_state("file-1", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_state_clears_chunks() {
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let dir = tempfile::tempdir().unwrap();
        let file = test_file(dir.path(), b"x");

        let state = store.initialize_state(&file, 2).await.unwrap();
        let chunk = ChunkState {
            index: 0,
            size: 1,
            offset: 0,
            checksum: "00".into(),
            attempts: 1,
            last_attempt_epoch_ms: 0,
            error: None,
        };
        store
            .save_chunk_state(&state.file_id, &chunk)
            .await
            .unwrap();

        store.remove_state(&state.file_id).await.unwrap();
        assert!(store.get_state(&state.file_id).await.unwrap().is_none());
        assert!(store
            .get_chunk_state(&state.file_id, 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_file_backend_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let file = test_file(dir.path(), b"durable");

        let state = {
            let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
            store.initialize_state(&file, 2).await.unwrap()
        };

        // A fresh store over the same directory sees the state
        let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
        let loaded = store.get_state(&state.file_id).await.unwrap().unwrap();
        assert_eq!(loaded.checksum, state.checksum);
    }

    #[tokio::test]
    async fn test_file_backend_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.get("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_file_sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_autosave_flushes_dirty_state() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(StateStore::new(backend.clone()));
        let dir = tempfile::tempdir().unwrap();
        let file = test_file(dir.path(), b"x");

        let mut state = store.initialize_state(&file, 1).await.unwrap();

        // Mutate the cache without going through the backend
        state.record_chunk(0, 1);
        store
            .cache
            .lock()
            .unwrap()
            .insert(state.file_id.clone(), state.clone());

        store.start_autosave(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.stop_autosave();

        let json = backend
            .get(&StateStore::state_key(&state.file_id))
            .await
            .unwrap()
            .unwrap();
        let persisted: UploadState = serde_json::from_str(&json).unwrap();
        assert!(persisted.uploaded_chunks.contains(&0));
    }
}
