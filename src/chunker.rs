//! Chunker
//!
//! Splits a file into an ordered sequence of chunks, either as fixed byte
//! ranges or as groups of parsed rows for tabular formats.

use crate::config::{ChunkingMode, UploadConfig};
use crate::error::{Result, UploadError};
use crate::models::{ChunkSpec, FileInfo, LineChunk};
use crate::sanitizer;
use calamine::Reader;
use std::sync::Arc;
use tracing::debug;

/// The full chunk sequence for one file
#[derive(Debug, Clone)]
pub enum ChunkPlan {
    /// Lazy byte-range views; payloads are read when a chunk is scheduled
    Binary(Vec<ChunkSpec>),
    /// Eagerly parsed, sanitized row groups with final totals
    Lines(Vec<LineChunk>),
}

impl ChunkPlan {
    /// Number of chunks in the plan
    pub fn total_chunks(&self) -> u32 {
        match self {
            ChunkPlan::Binary(specs) => specs.len() as u32,
            ChunkPlan::Lines(chunks) => chunks.len() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_chunks() == 0
    }
}

/// Calculator for splitting files into chunks
pub struct Chunker {
    config: Arc<UploadConfig>,
}

impl Chunker {
    pub fn new(config: Arc<UploadConfig>) -> Self {
        Chunker { config }
    }

    /// Produce the chunk plan for a file.
    ///
    /// The chunking rule is selected from the configured file types by MIME
    /// (first match wins, `other` as fallback). Size mode never reads the
    /// file; lines mode parses it fully, so every returned chunk already
    /// carries the real total.
    pub fn plan(&self, file: &FileInfo) -> Result<ChunkPlan> {
        let rule = self.config.file_type_for(&file.mime_type);
        if rule.value == 0 {
            return Err(UploadError::Chunking(format!(
                "chunking value for '{}' must be positive",
                rule.mime_pattern
            )));
        }

        match rule.mode {
            ChunkingMode::Size => {
                let specs = plan_size_chunks(file.size, rule.value)?;
                debug!(
                    "planned {} size chunks for {} ({} bytes, chunk_size={})",
                    specs.len(),
                    file.name,
                    file.size,
                    rule.value
                );
                Ok(ChunkPlan::Binary(specs))
            }
            ChunkingMode::Lines => {
                let chunks = self.plan_line_chunks(file, rule.value as usize)?;
                debug!(
                    "planned {} line chunks for {} ({} rows per chunk)",
                    chunks.len(),
                    file.name,
                    rule.value
                );
                Ok(ChunkPlan::Lines(chunks))
            }
        }
    }

    /// Parse the file into rows per its MIME type, sanitize every cell, and
    /// group `rows_per_chunk` rows per chunk.
    fn plan_line_chunks(&self, file: &FileInfo, rows_per_chunk: usize) -> Result<Vec<LineChunk>> {
        let rows = match file.mime_type.as_str() {
            "text/csv" => parse_csv_rows(file)?,
            "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                parse_spreadsheet_rows(file)?
            }
            mime if mime.starts_with("text/") => parse_text_rows(file)?,
            mime => {
                return Err(UploadError::Chunking(format!(
                    "line-based chunking is not supported for MIME type '{}'",
                    mime
                )));
            }
        };

        let total = rows.len().div_ceil(rows_per_chunk) as u32;
        let chunks: Vec<LineChunk> = rows
            .chunks(rows_per_chunk)
            .enumerate()
            .map(|(index, group)| LineChunk {
                index: index as u32,
                total,
                rows: group.to_vec(),
            })
            .collect();

        // Grouping cannot exceed the configured bound; anything else is a bug
        // in the parser above.
        if chunks.iter().any(|c| c.rows.len() > rows_per_chunk) {
            return Err(UploadError::Chunking(format!(
                "produced a chunk larger than {} rows",
                rows_per_chunk
            )));
        }

        Ok(chunks)
    }
}

/// Calculate the byte-range chunks for a file.
///
/// Chunk `i` covers `[i * chunk_size, min((i + 1) * chunk_size, file_size))`;
/// an empty file yields an empty plan. The returned specs are contiguous,
/// non-overlapping, and their sizes sum to `file_size`.
pub fn plan_size_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkSpec>> {
    if chunk_size == 0 {
        return Err(UploadError::Chunking("chunk size must be positive".into()));
    }
    if file_size == 0 {
        return Ok(Vec::new());
    }

    let total = file_size.div_ceil(chunk_size);
    if total > u32::MAX as u64 {
        return Err(UploadError::Chunking(format!(
            "file would produce {} chunks, above the supported maximum",
            total
        )));
    }
    let total = total as u32;

    let mut specs = Vec::with_capacity(total as usize);
    let mut offset = 0u64;
    for index in 0..total {
        let size = std::cmp::min(chunk_size, file_size - offset);
        specs.push(ChunkSpec {
            index,
            total,
            offset,
            size,
        });
        offset += size;
    }

    Ok(specs)
}

fn parse_csv_rows(file: &FileInfo) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&file.path)
        .map_err(|e| UploadError::Chunking(format!("failed to open CSV: {}", e)))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| UploadError::Chunking(format!("CSV parse error: {}", e)))?;
        rows.push(
            record
                .iter()
                .map(sanitizer::sanitize_cell)
                .collect::<Vec<_>>(),
        );
    }
    Ok(rows)
}

fn parse_spreadsheet_rows(file: &FileInfo) -> Result<Vec<Vec<String>>> {
    let mut workbook = calamine::open_workbook_auto(&file.path)
        .map_err(|e| UploadError::Chunking(format!("failed to open spreadsheet: {}", e)))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| UploadError::Chunking("spreadsheet has no worksheets".into()))?
        .map_err(|e| UploadError::Chunking(format!("spreadsheet parse error: {}", e)))?;

    Ok(range
        .rows()
        .map(|row| {
            row.iter()
                .map(|cell| sanitizer::sanitize_cell(&cell.to_string()))
                .collect()
        })
        .collect())
}

fn parse_text_rows(file: &FileInfo) -> Result<Vec<Vec<String>>> {
    let content = std::fs::read_to_string(&file.path)
        .map_err(|e| UploadError::Chunking(format!("failed to read text file: {}", e)))?;

    Ok(content
        .lines()
        .map(|line| vec![sanitizer::sanitize_cell(line)])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileId;
    use std::io::Write;

    fn file_info(path: std::path::PathBuf, size: u64, mime: &str) -> FileInfo {
        FileInfo {
            id: FileId::new(),
            name: path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            size,
            mime_type: mime.to_string(),
            last_modified_ms: 0,
            path,
        }
    }

    #[test]
    fn test_size_chunks_exact_multiple() {
        let specs = plan_size_chunks(4096, 1024).unwrap();
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.size == 1024 && s.total == 4));
    }

    #[test]
    fn test_size_chunks_with_remainder() {
        let specs = plan_size_chunks(4097, 1024).unwrap();
        assert_eq!(specs.len(), 5);
        assert_eq!(specs[4].size, 1);
        assert_eq!(specs[4].offset, 4096);
    }

    #[test]
    fn test_size_chunks_single() {
        let specs = plan_size_chunks(512, 1024).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].total, 1);
        assert_eq!(specs[0].size, 512);
    }

    #[test]
    fn test_size_chunks_empty_file() {
        assert!(plan_size_chunks(0, 1024).unwrap().is_empty());
    }

    #[test]
    fn test_size_chunks_contiguous_coverage() {
        let specs = plan_size_chunks(5500, 1000).unwrap();
        assert_eq!(specs[0].offset, 0);
        for pair in specs.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
        assert_eq!(specs.last().unwrap().end(), 5500);
        assert_eq!(specs.iter().map(|s| s.size).sum::<u64>(), 5500);
    }

    #[test]
    fn test_size_chunks_zero_chunk_size() {
        assert!(plan_size_chunks(100, 0).is_err());
    }

    #[test]
    fn test_csv_line_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..5 {
            writeln!(f, "row{},value{}", i, i).unwrap();
        }
        drop(f);

        let mut config = UploadConfig::default();
        config.file_types = vec![crate::config::FileTypeConfig {
            mime_pattern: "text/csv".to_string(),
            mode: ChunkingMode::Lines,
            value: 2,
        }];
        let chunker = Chunker::new(Arc::new(config));
        let size = std::fs::metadata(&path).unwrap().len();
        let plan = chunker.plan(&file_info(path, size, "text/csv")).unwrap();

        let ChunkPlan::Lines(chunks) = plan else {
            panic!("expected line chunks");
        };
        assert_eq!(chunks.len(), 3);
        // Every chunk carries the final total
        assert!(chunks.iter().all(|c| c.total == 3));
        assert_eq!(chunks[0].rows.len(), 2);
        assert_eq!(chunks[2].rows.len(), 1);
        assert_eq!(chunks[0].rows[0], vec!["row0", "value0"]);
    }

    #[test]
    fn test_text_line_chunks_single_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "alpha\r\nbeta\ngamma").unwrap();

        let config = UploadConfig::default();
        let chunker = Chunker::new(Arc::new(config));
        let size = std::fs::metadata(&path).unwrap().len();
        let plan = chunker.plan(&file_info(path, size, "text/plain")).unwrap();

        let ChunkPlan::Lines(chunks) = plan else {
            panic!("expected line chunks");
        };
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].rows,
            vec![vec!["alpha"], vec!["beta"], vec!["gamma"]]
        );
    }

    #[test]
    fn test_binary_fallback_for_unmatched_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![0u8; 3000]).unwrap();

        let mut config = UploadConfig::default();
        config.file_types = vec![crate::config::FileTypeConfig {
            mime_pattern: "other".to_string(),
            mode: ChunkingMode::Size,
            value: 1024,
        }];
        let chunker = Chunker::new(Arc::new(config));
        let plan = chunker
            .plan(&file_info(path, 3000, "application/octet-stream"))
            .unwrap();

        let ChunkPlan::Binary(specs) = plan else {
            panic!("expected binary chunks");
        };
        assert_eq!(specs.len(), 3);
    }

    #[test]
    fn test_lines_mode_rejects_binary_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut config = UploadConfig::default();
        config.file_types = vec![crate::config::FileTypeConfig {
            mime_pattern: "application/octet-stream".to_string(),
            mode: ChunkingMode::Lines,
            value: 10,
        }];
        let chunker = Chunker::new(Arc::new(config));
        let result = chunker.plan(&file_info(path, 4, "application/octet-stream"));
        assert!(result.is_err());
    }

    #[test]
    fn test_cells_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirty.csv");
        std::fs::write(&path, "<b>name</b>,  padded  \n").unwrap();

        let mut config = UploadConfig::default();
        config.file_types = vec![crate::config::FileTypeConfig {
            mime_pattern: "text/csv".to_string(),
            mode: ChunkingMode::Lines,
            value: 10,
        }];
        let chunker = Chunker::new(Arc::new(config));
        let size = std::fs::metadata(&path).unwrap().len();
        let plan = chunker.plan(&file_info(path, size, "text/csv")).unwrap();

        let ChunkPlan::Lines(chunks) = plan else {
            panic!("expected line chunks");
        };
        assert_eq!(chunks[0].rows[0], vec!["name", "padded"]);
    }
}
