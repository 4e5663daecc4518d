// State persistence invariants across both backends:
// - bytes_uploaded always equals the sum of recorded chunk sizes
// - the resumable set is exactly the complement of the uploaded set
// - a fresh store over the same file backend reconstructs the state

use chunkflow::{
    ChunkState, FileBackend, FileId, FileInfo, MemoryBackend, StateBackend, StateStore,
    UploadStatus,
};
use std::sync::Arc;

fn test_file(dir: &std::path::Path, size: usize) -> FileInfo {
    let path = dir.join("data.bin");
    std::fs::write(&path, vec![7u8; size]).unwrap();
    FileInfo {
        id: FileId::new(),
        name: "data.bin".into(),
        size: size as u64,
        mime_type: "application/octet-stream".into(),
        last_modified_ms: 0,
        path,
    }
}

#[tokio::test]
async fn bytes_uploaded_tracks_recorded_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(Arc::new(MemoryBackend::new()));
    let file = test_file(dir.path(), 4096);

    let mut state = store.initialize_state(&file, 4).await.unwrap();
    assert_eq!(state.bytes_uploaded, 0);

    state.record_chunk(0, 1024);
    state.record_chunk(3, 1024);
    // Recording an index twice never double counts
    state.record_chunk(0, 1024);
    store.save_state(&state).await.unwrap();

    let loaded = store.get_state(&state.file_id).await.unwrap().unwrap();
    assert_eq!(loaded.bytes_uploaded, 2048);
    assert_eq!(loaded.uploaded_chunks.len(), 2);
}

#[tokio::test]
async fn resumable_set_is_the_complement() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(Arc::new(MemoryBackend::new()));
    let file = test_file(dir.path(), 5120);

    let mut state = store.initialize_state(&file, 5).await.unwrap();
    state.record_chunk(1, 1024);
    state.record_chunk(4, 1024);
    store.save_state(&state).await.unwrap();

    let remaining = store.resumable_chunks(&state.file_id).await.unwrap();
    assert_eq!(remaining, vec![0, 2, 3]);
}

#[tokio::test]
async fn crash_and_reload_preserves_progress() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let file = test_file(dir.path(), 4096);
    let file_id = file.id.as_str().to_string();

    // First process: three of four chunks acknowledged, then the process dies
    {
        let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
        let mut state = store.initialize_state(&file, 4).await.unwrap();
        state.set_status(UploadStatus::Uploading);
        state.record_chunk(0, 1024);
        state.record_chunk(2, 1024);
        state.record_chunk(3, 1024);
        store.save_state(&state).await.unwrap();
    }

    // Second process: a cold store over the same directory
    let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
    assert!(store.can_resume(&file_id).await);
    let remaining = store.resumable_chunks(&file_id).await.unwrap();
    assert_eq!(remaining, vec![1]);

    let state = store.get_state(&file_id).await.unwrap().unwrap();
    assert_eq!(state.bytes_uploaded, 3072);
    assert_eq!(state.status, UploadStatus::Uploading);
}

#[tokio::test]
async fn completed_upload_is_not_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(Arc::new(MemoryBackend::new()));
    let file = test_file(dir.path(), 1024);

    let mut state = store.initialize_state(&file, 1).await.unwrap();
    state.record_chunk(0, 1024);
    assert_eq!(state.status, UploadStatus::Completed);
    store.save_state(&state).await.unwrap();

    assert!(!store.can_resume(&state.file_id).await);
    assert!(store
        .resumable_chunks(&state.file_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn chunk_states_survive_restart_on_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");

    {
        let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
        let chunk = ChunkState {
            index: 1,
            size: 1024,
            offset: 1024,
            checksum: "cafe".into(),
            attempts: 2,
            last_attempt_epoch_ms: 99,
            error: Some("503 Service Unavailable".into()),
        };
        store.save_chunk_state("file-x", &chunk).await.unwrap();
    }

    let store = StateStore::new(Arc::new(FileBackend::new(&state_dir)));
    let chunk = store.get_chunk_state("file-x", 1).await.unwrap().unwrap();
    assert_eq!(chunk.attempts, 2);
    assert_eq!(chunk.error.as_deref(), Some("503 Service Unavailable"));
}

#[tokio::test]
async fn persisted_layout_uses_documented_keys() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let store = StateStore::new(backend.clone());
    let file = test_file(dir.path(), 1024);

    let state = store.initialize_state(&file, 1).await.unwrap();
    let chunk = ChunkState {
        index: 0,
        size: 1024,
        offset: 0,
        checksum: "00".into(),
        attempts: 1,
        last_attempt_epoch_ms: 0,
        error: None,
    };
    store.save_chunk_state(&state.file_id, &chunk).await.unwrap();

    let keys = backend.keys().await.unwrap();
    assert!(keys.contains(&format!("upload_state_{}", state.file_id)));
    assert!(keys.contains(&format!("chunk_state_{}_0", state.file_id)));
}
