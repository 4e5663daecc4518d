//! Bounded cache for recently produced chunk payloads
//!
//! Entries are keyed by file identity (name, size, mtime) plus chunk index,
//! expire after a TTL, and are evicted least-recently-used when the cache is
//! full. Stored payloads carry a SHA-256 digest that is re-verified on every
//! read; a mismatch evicts the entry and reports a miss, so corruption is
//! recovered by re-producing the chunk.
//!
//! The cache is a pure optimization: a cold cache changes latency only.

use crate::compressor::Compressor;
use crate::config::CacheConfig;
use crate::models::FileInfo;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct CacheEntry {
    data: Bytes,
    compressed: bool,
    checksum: String,
    stored_at: Instant,
    last_accessed: Instant,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded TTL + LRU cache of chunk payloads
pub struct ChunkCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    max_age: Duration,
    compressor: Compressor,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkCache {
    pub fn new(config: &CacheConfig) -> Self {
        ChunkCache {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries,
            max_age: Duration::from_secs(config.max_age_secs),
            compressor: Compressor::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for one chunk of one file
    fn cache_key(file: &FileInfo, chunk_index: u32) -> String {
        format!("{}:{}", file.cache_key(), chunk_index)
    }

    /// Look up a chunk payload.
    ///
    /// Returns the decompressed payload on a hit. Expired entries and entries
    /// whose stored digest no longer matches are evicted and count as misses.
    pub fn get(&self, file: &FileInfo, chunk_index: u32) -> Option<Bytes> {
        let key = Self::cache_key(file, chunk_index);

        let mut found: Option<(Bytes, bool)> = None;
        let mut evict = false;
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&key) {
                if entry.stored_at.elapsed() > self.max_age {
                    debug!("cache entry expired: {}", key);
                    evict = true;
                } else if hex_digest(&entry.data) != entry.checksum {
                    warn!("cache digest mismatch, evicting: {}", key);
                    evict = true;
                } else {
                    entry.last_accessed = Instant::now();
                    found = Some((entry.data.clone(), entry.compressed));
                }
            }
            if evict {
                entries.remove(&key);
            }
        }

        let result = match found {
            Some((data, true)) => match self.compressor.decompress(&data) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    warn!("cached chunk failed to decompress ({}), evicting", e);
                    self.entries.lock().unwrap().remove(&key);
                    None
                }
            },
            Some((data, false)) => Some(data),
            None => None,
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Store a chunk payload, compressing it when it passes the gate.
    ///
    /// Expired entries are swept first; if the cache is still full the least
    /// recently used entry is evicted.
    pub fn put(&self, file: &FileInfo, chunk_index: u32, payload: &[u8]) {
        let (data, compressed) = if Compressor::should_compress(payload.len()) {
            match self.compressor.compress(payload) {
                Ok(out) => (out.data, out.compressed),
                Err(e) => {
                    warn!("chunk cache compression failed ({}), storing raw", e);
                    (Bytes::copy_from_slice(payload), false)
                }
            }
        } else {
            (Bytes::copy_from_slice(payload), false)
        };

        let checksum = hex_digest(&data);
        let now = Instant::now();
        let key = Self::cache_key(file, chunk_index);

        let mut entries = self.entries.lock().unwrap();

        entries.retain(|_, e| e.stored_at.elapsed() <= self.max_age);

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("cache full, evicting LRU entry: {}", oldest);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                data,
                compressed,
                checksum,
                stored_at: now,
                last_accessed: now,
            },
        );
    }

    /// Drop every cached chunk for one file
    pub fn invalidate_file(&self, file: &FileInfo) {
        let prefix = format!("{}:", file.cache_key());
        self.entries
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn get_stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            entries: self.entries.lock().unwrap().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
