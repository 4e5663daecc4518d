//! Chunk compression using raw DEFLATE

use crate::error::{Result, UploadError};
use crate::models::LineChunk;
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::Instant;
use tracing::debug;

/// Payloads at or below this size are sent uncompressed
pub const COMPRESSION_MIN_SIZE: usize = 1024; // 1KB

/// Statistics for one compression pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    /// `compressed_size / original_size`; 1.0 when nothing was compressed
    pub ratio: f64,
    pub wall_time_ms: u64,
}

/// A chunk payload after the compression stage
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    pub data: Bytes,
    pub compressed: bool,
    pub stats: CompressionStats,
}

/// Raw-DEFLATE compressor for chunk payloads
#[derive(Debug, Clone)]
pub struct Compressor {
    level: Compression,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    pub fn new() -> Self {
        Compressor {
            level: Compression::default(),
        }
    }

    /// Whether a payload of this size passes the compression gate
    pub fn should_compress(size: usize) -> bool {
        size > COMPRESSION_MIN_SIZE
    }

    /// Compress a chunk payload.
    ///
    /// Payloads at or below the gate are passed through unchanged with
    /// `compressed = false`.
    pub fn compress(&self, payload: &[u8]) -> Result<CompressedChunk> {
        let start = Instant::now();

        if !Self::should_compress(payload.len()) {
            return Ok(CompressedChunk {
                data: Bytes::copy_from_slice(payload),
                compressed: false,
                stats: CompressionStats {
                    original_size: payload.len(),
                    compressed_size: payload.len(),
                    ratio: 1.0,
                    wall_time_ms: 0,
                },
            });
        }

        let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), self.level);
        encoder
            .write_all(payload)
            .map_err(|e| UploadError::Compression(format!("deflate write failed: {}", e)))?;
        let data = encoder
            .finish()
            .map_err(|e| UploadError::Compression(format!("deflate finish failed: {}", e)))?;

        let stats = CompressionStats {
            original_size: payload.len(),
            compressed_size: data.len(),
            ratio: if payload.is_empty() {
                1.0
            } else {
                data.len() as f64 / payload.len() as f64
            },
            wall_time_ms: start.elapsed().as_millis() as u64,
        };

        debug!(
            "compressed chunk: {} -> {} bytes (ratio {:.3})",
            stats.original_size, stats.compressed_size, stats.ratio
        );

        Ok(CompressedChunk {
            data: Bytes::from(data),
            compressed: true,
            stats,
        })
    }

    /// JSON-encode a line chunk's rows and compress the encoding
    pub fn compress_rows(&self, chunk: &LineChunk) -> Result<CompressedChunk> {
        let encoded = serde_json::to_vec(&chunk.rows)
            .map_err(|e| UploadError::Compression(format!("row encoding failed: {}", e)))?;
        self.compress(&encoded)
    }

    /// Reverse `compress`: decompressed bytes are identical to the input
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoder = DeflateDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| UploadError::Compression(format!("inflate failed: {}", e)))?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_passes_through() {
        let compressor = Compressor::new();
        let payload = vec![7u8; 100];
        let out = compressor.compress(&payload).unwrap();

        assert!(!out.compressed);
        assert_eq!(out.data.as_ref(), payload.as_slice());
        assert_eq!(out.stats.ratio, 1.0);
    }

    #[test]
    fn test_gate_boundary() {
        assert!(!Compressor::should_compress(COMPRESSION_MIN_SIZE));
        assert!(Compressor::should_compress(COMPRESSION_MIN_SIZE + 1));
    }

    #[test]
    fn test_round_trip() {
        let compressor = Compressor::new();
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let out = compressor.compress(&payload).unwrap();

        assert!(out.compressed);
        let restored = compressor.decompress(&out.data).unwrap();
        assert_eq!(restored.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let compressor = Compressor::new();
        let payload = vec![0u8; 64 * 1024];
        let out = compressor.compress(&payload).unwrap();

        assert!(out.compressed);
        assert!(out.stats.compressed_size < out.stats.original_size);
        assert!(out.stats.ratio < 1.0);
    }

    #[test]
    fn test_compress_rows_round_trip() {
        let compressor = Compressor::new();
        let chunk = LineChunk {
            index: 0,
            total: 1,
            rows: vec![
                vec!["a".repeat(600), "b".repeat(600)],
                vec!["c".into(), "d".into()],
            ],
        };
        let out = compressor.compress_rows(&chunk).unwrap();
        assert!(out.compressed);

        let restored = compressor.decompress(&out.data).unwrap();
        let rows: Vec<Vec<String>> = serde_json::from_slice(&restored).unwrap();
        assert_eq!(rows, chunk.rows);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let compressor = Compressor::new();
        assert!(compressor.decompress(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
