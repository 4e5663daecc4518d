//! Upload telemetry
//!
//! A single bank of atomic counters indexed by [`Stat`]. Components record
//! through the domain-level `record_*` methods; consumers take a
//! [`MetricsSnapshot`] and derive rates from it. External metrics sinks are
//! out of scope; this collector is what they would scrape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Every statistic the engine tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    UploadsStarted,
    UploadsResumed,
    UploadsCompleted,
    UploadsFailed,
    ChunksUploaded,
    ChunksFailed,
    ChunksRetried,
    BytesUploaded,
    BytesSavedByCompression,
    CacheHits,
    CacheMisses,
    /// Cumulative wall time of chunk upload attempts, in milliseconds
    ChunkTimeMs,
}

impl Stat {
    const COUNT: usize = 12;

    pub const ALL: [Stat; Stat::COUNT] = [
        Stat::UploadsStarted,
        Stat::UploadsResumed,
        Stat::UploadsCompleted,
        Stat::UploadsFailed,
        Stat::ChunksUploaded,
        Stat::ChunksFailed,
        Stat::ChunksRetried,
        Stat::BytesUploaded,
        Stat::BytesSavedByCompression,
        Stat::CacheHits,
        Stat::CacheMisses,
        Stat::ChunkTimeMs,
    ];

    fn slot(self) -> usize {
        Stat::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

/// Thread-safe metrics collector for the upload engine
#[derive(Debug)]
pub struct UploadMetrics {
    counters: [AtomicU64; Stat::COUNT],
}

impl Default for UploadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadMetrics {
    pub fn new() -> Self {
        UploadMetrics {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Add `amount` to one statistic
    pub fn add(&self, stat: Stat, amount: u64) {
        self.counters[stat.slot()].fetch_add(amount, Ordering::Relaxed);
    }

    fn bump(&self, stat: Stat) {
        self.add(stat, 1);
    }

    /// Current value of one statistic
    pub fn value(&self, stat: Stat) -> u64 {
        self.counters[stat.slot()].load(Ordering::Relaxed)
    }

    /// Record an upload starting; `resumed` marks a continued session
    pub fn record_upload_started(&self, resumed: bool) {
        self.bump(Stat::UploadsStarted);
        if resumed {
            self.bump(Stat::UploadsResumed);
        }
    }

    /// Record an upload reaching a terminal state
    pub fn record_upload_finished(&self, success: bool) {
        self.bump(if success {
            Stat::UploadsCompleted
        } else {
            Stat::UploadsFailed
        });
    }

    /// Record a chunk POST outcome
    pub fn record_chunk(&self, success: bool) {
        self.bump(if success {
            Stat::ChunksUploaded
        } else {
            Stat::ChunksFailed
        });
    }

    /// Record a chunk retry attempt
    pub fn record_chunk_retry(&self) {
        self.bump(Stat::ChunksRetried);
    }

    /// Record bytes acknowledged by the sink
    pub fn record_bytes_uploaded(&self, bytes: u64) {
        self.add(Stat::BytesUploaded, bytes);
    }

    /// Record bytes saved by compression (original minus compressed)
    pub fn record_compression_saving(&self, bytes: u64) {
        self.add(Stat::BytesSavedByCompression, bytes);
    }

    /// Record a chunk cache hit
    pub fn record_cache_hit(&self) {
        self.bump(Stat::CacheHits);
    }

    /// Record a chunk cache miss
    pub fn record_cache_miss(&self) {
        self.bump(Stat::CacheMisses);
    }

    /// Record the wall time of one chunk upload attempt
    pub fn record_chunk_duration(&self, duration: Duration) {
        self.add(Stat::ChunkTimeMs, duration.as_millis() as u64);
    }

    /// Take a point-in-time snapshot of every statistic.
    ///
    /// Counters are read one after another, so a snapshot taken under load
    /// may not be perfectly consistent across statistics.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counts: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
        }
    }

    /// Zero every statistic. Primarily useful for testing.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Frozen view of the counters with derived rates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    counts: [u64; Stat::COUNT],
}

/// `part` as a percentage of `whole`, 0.0 when `whole` is zero
fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl MetricsSnapshot {
    /// Value of one statistic at snapshot time
    pub fn get(&self, stat: Stat) -> u64 {
        self.counts[stat.slot()]
    }

    pub fn uploads_started(&self) -> u64 {
        self.get(Stat::UploadsStarted)
    }

    pub fn uploads_resumed(&self) -> u64 {
        self.get(Stat::UploadsResumed)
    }

    pub fn uploads_completed(&self) -> u64 {
        self.get(Stat::UploadsCompleted)
    }

    pub fn uploads_failed(&self) -> u64 {
        self.get(Stat::UploadsFailed)
    }

    pub fn chunks_uploaded(&self) -> u64 {
        self.get(Stat::ChunksUploaded)
    }

    pub fn chunks_failed(&self) -> u64 {
        self.get(Stat::ChunksFailed)
    }

    pub fn chunks_retried(&self) -> u64 {
        self.get(Stat::ChunksRetried)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.get(Stat::BytesUploaded)
    }

    pub fn bytes_saved_by_compression(&self) -> u64 {
        self.get(Stat::BytesSavedByCompression)
    }

    pub fn cache_hits(&self) -> u64 {
        self.get(Stat::CacheHits)
    }

    pub fn cache_misses(&self) -> u64 {
        self.get(Stat::CacheMisses)
    }

    /// POST attempts: acknowledged plus failed chunks
    fn chunk_attempts(&self) -> u64 {
        self.get(Stat::ChunksUploaded) + self.get(Stat::ChunksFailed)
    }

    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.get(Stat::CacheHits);
        percentage(hits, hits + self.get(Stat::CacheMisses))
    }

    /// Chunk failure rate as a percentage (0.0 to 100.0)
    pub fn chunk_failure_rate(&self) -> f64 {
        percentage(self.get(Stat::ChunksFailed), self.chunk_attempts())
    }

    /// Average wall time per chunk attempt, in milliseconds
    pub fn avg_chunk_duration_ms(&self) -> f64 {
        let attempts = self.chunk_attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.get(Stat::ChunkTimeMs) as f64 / attempts as f64
    }
}
