//! Configuration management for the upload engine

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration for the upload engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Default chunk size in bytes for size-based chunking (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Maximum chunks in flight per file (default: 4)
    #[serde(default = "default_concurrent_streams")]
    pub concurrent_streams: usize,

    /// Whether chunk payloads above the size gate are DEFLATE-compressed
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Whether chunks are validated on the worker pool before upload
    #[serde(default = "default_true")]
    pub validate_chunks: bool,

    /// Maximum retries for worker-pool tasks (default: 3)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// File validation, encryption, rate limiting and token settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Memory accounting settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Resumability and state persistence settings
    #[serde(default)]
    pub resumable: ResumableConfig,

    /// Chunk cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-MIME chunking rules; first match wins, `other` is the fallback
    #[serde(default = "default_file_types")]
    pub file_types: Vec<FileTypeConfig>,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Upper bound on worker count; the pool uses
    /// `min(max_workers, available_parallelism)` (default: 8)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-task timeout in seconds (default: 30)
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// File validation, encryption, rate limiting and access tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Maximum accepted file size in bytes (default: 100MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Accepted MIME types; `*/*` accepts everything, `image/*` by prefix
    #[serde(default = "default_any_list")]
    pub allowed_mime_types: Vec<String>,

    /// Accepted file extensions (without dot); `*` accepts everything
    #[serde(default = "default_any_list")]
    pub allowed_extensions: Vec<String>,

    /// Compare leading file bytes against the magic-byte table
    #[serde(default)]
    pub validate_file_signature: bool,

    /// Scan the file for suspicious executable headers
    #[serde(default)]
    pub enable_virus_scan: bool,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub access_control: AccessControlConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_mime_types: default_any_list(),
            allowed_extensions: default_any_list(),
            validate_file_signature: false,
            enable_virus_scan: false,
            encryption: EncryptionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            access_control: AccessControlConfig::default(),
        }
    }
}

/// AES-GCM chunk encryption settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Only `aes-gcm` is supported
    #[serde(default = "default_encryption_algorithm")]
    pub algorithm: String,

    /// Key size in bits: 128 or 256 (default: 256)
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: default_encryption_algorithm(),
            key_size: default_key_size(),
        }
    }
}

/// Per-user rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sliding 60-second window bound (default: 60)
    #[serde(default = "default_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Concurrent upload bound per user (default: 3)
    #[serde(default = "default_concurrent_uploads")]
    pub max_concurrent_uploads: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_requests_per_minute: default_requests_per_minute(),
            max_concurrent_uploads: default_concurrent_uploads(),
        }
    }
}

/// Access token lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessControlConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Token lifetime in seconds; must be positive (default: 3600)
    #[serde(default = "default_token_expiration_secs")]
    pub token_expiration_secs: u64,

    /// Live tokens per user; the oldest is evicted beyond this (default: 5)
    #[serde(default = "default_max_tokens_per_user")]
    pub max_tokens_per_user: usize,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_expiration_secs: default_token_expiration_secs(),
            max_tokens_per_user: default_max_tokens_per_user(),
        }
    }
}

/// Memory accounting thresholds and cleanup cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Byte budget for live pipeline resources (default: 256MB)
    #[serde(default = "default_max_memory_usage")]
    pub max_memory_usage: u64,

    /// Seconds between memory checks (default: 30)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Run the periodic check task
    #[serde(default = "default_true")]
    pub enable_auto_cleanup: bool,

    #[serde(default)]
    pub thresholds: MemoryThresholds,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: default_max_memory_usage(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            enable_auto_cleanup: default_true(),
            thresholds: MemoryThresholds::default(),
        }
    }
}

/// Fractions of `max_memory_usage` at which cleanup escalates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemoryThresholds {
    #[serde(default = "default_warning_threshold")]
    pub warning: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning: default_warning_threshold(),
            critical: default_critical_threshold(),
        }
    }
}

/// Resumability and state persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempt cap applied by the retry strategies for chunk uploads
    #[serde(default = "default_resumable_max_retries")]
    pub max_retries: u32,

    /// Base delay for chunk retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Post the per-chunk checksum field to the sink
    #[serde(default = "default_true")]
    pub checksum_verification: bool,

    /// `memory` or `file`
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Directory for the `file` backend
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Seconds between autosave flushes (default: 5)
    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,
}

impl Default for ResumableConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_retries: default_resumable_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            checksum_verification: default_true(),
            storage_backend: default_storage_backend(),
            state_dir: default_state_dir(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
        }
    }
}

/// Chunk cache bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum cached chunks (default: 100)
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Entry time-to-live in seconds (default: 3600)
    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_age_secs: default_cache_max_age_secs(),
        }
    }
}

/// How a chunk boundary is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMode {
    /// Fixed byte ranges
    Size,
    /// Groups of parsed rows
    Lines,
}

/// Chunking rule for one MIME pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileTypeConfig {
    /// Exact MIME (`text/csv`), prefix pattern (`text/*`), or `other`
    pub mime_pattern: String,
    pub mode: ChunkingMode,
    /// Bytes per chunk in size mode, rows per chunk in lines mode
    pub value: u64,
}

impl FileTypeConfig {
    /// Whether this rule applies to the given MIME type.
    ///
    /// Patterns ending in `/*` match by prefix; `other` matches nothing here
    /// and is only consulted as the configured fallback.
    pub fn matches(&self, mime: &str) -> bool {
        if self.mime_pattern == "other" {
            return false;
        }
        if let Some(prefix) = self.mime_pattern.strip_suffix("/*") {
            mime.split('/').next() == Some(prefix)
        } else {
            self.mime_pattern.eq_ignore_ascii_case(mime)
        }
    }
}

// Default value functions for serde
fn default_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_concurrent_streams() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    8
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_any_list() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_encryption_algorithm() -> String {
    "aes-gcm".to_string()
}

fn default_key_size() -> usize {
    256
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_concurrent_uploads() -> u32 {
    3
}

fn default_token_expiration_secs() -> u64 {
    3600 // 1 hour; deliberately positive so no zero-delay expiry can be scheduled
}

fn default_max_tokens_per_user() -> usize {
    5
}

fn default_max_memory_usage() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_warning_threshold() -> f64 {
    0.7
}

fn default_critical_threshold() -> f64 {
    0.9
}

fn default_resumable_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_state_dir() -> String {
    ".chunkflow-state".to_string()
}

fn default_auto_save_interval_secs() -> u64 {
    5
}

fn default_cache_max_entries() -> usize {
    100
}

fn default_cache_max_age_secs() -> u64 {
    3600
}

fn default_file_types() -> Vec<FileTypeConfig> {
    vec![
        FileTypeConfig {
            mime_pattern: "text/csv".to_string(),
            mode: ChunkingMode::Lines,
            value: 500,
        },
        FileTypeConfig {
            mime_pattern: "application/vnd.ms-excel".to_string(),
            mode: ChunkingMode::Lines,
            value: 500,
        },
        FileTypeConfig {
            mime_pattern: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                .to_string(),
            mode: ChunkingMode::Lines,
            value: 500,
        },
        FileTypeConfig {
            mime_pattern: "text/*".to_string(),
            mode: ChunkingMode::Lines,
            value: 1000,
        },
        FileTypeConfig {
            mime_pattern: "other".to_string(),
            mode: ChunkingMode::Size,
            value: default_chunk_size(),
        },
    ]
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_size: default_chunk_size(),
            concurrent_streams: default_concurrent_streams(),
            compression_enabled: default_true(),
            validate_chunks: default_true(),
            retry_attempts: default_retry_attempts(),
            worker: WorkerConfig::default(),
            security: SecurityConfig::default(),
            memory: MemoryConfig::default(),
            resumable: ResumableConfig::default(),
            cache: CacheConfig::default(),
            file_types: default_file_types(),
        }
    }
}

impl UploadConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(UploadConfig)` if loading and validation succeed
    /// * `Err(UploadError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| UploadError::Config(format!("failed to read config file: {}", e)))?;

        let config: UploadConfig = serde_yaml::from_str(&content)
            .map_err(|e| UploadError::Config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - chunk_size must be between 1KB and 100MB
    /// - concurrent_streams and worker counts must be > 0
    /// - encryption key size must be 128 or 256
    /// - rate-limit bounds must be > 0 when enabled
    /// - token_expiration_secs must be > 0 when access control is enabled
    /// - memory thresholds must satisfy 0 < warning < critical <= 1
    /// - storage_backend must be `memory` or `file`
    /// - every file-type rule needs a positive value, and lines mode only
    ///   applies to text and spreadsheet MIMEs
    pub fn validate(&self) -> Result<()> {
        const MIN_CHUNK_SIZE: u64 = 1024; // 1KB
        const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024; // 100MB

        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(UploadError::Config(format!(
                "chunk_size must be between {}B and {}MB, got {} bytes",
                MIN_CHUNK_SIZE,
                MAX_CHUNK_SIZE / (1024 * 1024),
                self.chunk_size
            )));
        }

        if self.concurrent_streams == 0 {
            return Err(UploadError::Config(
                "concurrent_streams must be greater than 0".to_string(),
            ));
        }

        if self.worker.max_workers == 0 {
            return Err(UploadError::Config(
                "worker.max_workers must be greater than 0".to_string(),
            ));
        }

        if self.worker.task_timeout_secs == 0 {
            return Err(UploadError::Config(
                "worker.task_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.security.encryption.enabled {
            if self.security.encryption.algorithm != "aes-gcm" {
                return Err(UploadError::Config(format!(
                    "unsupported encryption algorithm '{}'",
                    self.security.encryption.algorithm
                )));
            }
            if !matches!(self.security.encryption.key_size, 128 | 256) {
                return Err(UploadError::Config(format!(
                    "encryption.key_size must be 128 or 256, got {}",
                    self.security.encryption.key_size
                )));
            }
        }

        if self.security.rate_limit.enabled {
            if self.security.rate_limit.max_requests_per_minute == 0 {
                return Err(UploadError::Config(
                    "rate_limit.max_requests_per_minute must be greater than 0".to_string(),
                ));
            }
            if self.security.rate_limit.max_concurrent_uploads == 0 {
                return Err(UploadError::Config(
                    "rate_limit.max_concurrent_uploads must be greater than 0".to_string(),
                ));
            }
        }

        if self.security.access_control.enabled {
            if self.security.access_control.token_expiration_secs == 0 {
                return Err(UploadError::Config(
                    "access_control.token_expiration_secs must be greater than 0".to_string(),
                ));
            }
            if self.security.access_control.max_tokens_per_user == 0 {
                return Err(UploadError::Config(
                    "access_control.max_tokens_per_user must be greater than 0".to_string(),
                ));
            }
        }

        let t = &self.memory.thresholds;
        if !(t.warning > 0.0 && t.warning < t.critical && t.critical <= 1.0) {
            return Err(UploadError::Config(format!(
                "memory thresholds must satisfy 0 < warning < critical <= 1, got warning={} critical={}",
                t.warning, t.critical
            )));
        }

        match self.resumable.storage_backend.as_str() {
            "memory" | "file" => {}
            other => {
                return Err(UploadError::Config(format!(
                    "invalid storage_backend '{}', must be 'memory' or 'file'",
                    other
                )));
            }
        }

        if self.cache.max_entries == 0 {
            return Err(UploadError::Config(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }

        for ft in &self.file_types {
            if ft.value == 0 {
                return Err(UploadError::Config(format!(
                    "file type '{}' has a zero chunking value",
                    ft.mime_pattern
                )));
            }
        }

        Ok(())
    }

    /// Find the chunking rule for a MIME type: first match wins, the `other`
    /// entry is the fallback, and a built-in size rule backstops a config
    /// with no fallback.
    pub fn file_type_for(&self, mime: &str) -> FileTypeConfig {
        if let Some(ft) = self.file_types.iter().find(|ft| ft.matches(mime)) {
            return ft.clone();
        }
        if let Some(other) = self.file_types.iter().find(|ft| ft.mime_pattern == "other") {
            return other.clone();
        }
        FileTypeConfig {
            mime_pattern: "other".to_string(),
            mode: ChunkingMode::Size,
            value: self.chunk_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UploadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.concurrent_streams, 4);
        assert!(config.compression_enabled);
    }

    #[test]
    fn test_validate_chunk_size_bounds() {
        let mut config = UploadConfig::default();
        config.chunk_size = 512;
        assert!(config.validate().is_err());

        config.chunk_size = 200 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_streams() {
        let mut config = UploadConfig::default();
        config.concurrent_streams = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_key_size() {
        let mut config = UploadConfig::default();
        config.security.encryption.enabled = true;
        config.security.encryption.key_size = 192;
        assert!(config.validate().is_err());

        config.security.encryption.key_size = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_token_expiration_must_be_positive() {
        let mut config = UploadConfig::default();
        config.security.access_control.enabled = true;
        config.security.access_control.token_expiration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_thresholds() {
        let mut config = UploadConfig::default();
        config.memory.thresholds = MemoryThresholds {
            warning: 0.9,
            critical: 0.7,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_storage_backend() {
        let mut config = UploadConfig::default();
        config.resumable.storage_backend = "redis".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mime_pattern_matching() {
        let ft = FileTypeConfig {
            mime_pattern: "image/*".to_string(),
            mode: ChunkingMode::Size,
            value: 1024,
        };
        assert!(ft.matches("image/png"));
        assert!(ft.matches("image/jpeg"));
        assert!(!ft.matches("video/mp4"));

        let exact = FileTypeConfig {
            mime_pattern: "text/csv".to_string(),
            mode: ChunkingMode::Lines,
            value: 100,
        };
        assert!(exact.matches("text/csv"));
        assert!(!exact.matches("text/plain"));
    }

    #[test]
    fn test_file_type_selection_first_match_wins() {
        let config = UploadConfig::default();
        let csv = config.file_type_for("text/csv");
        assert_eq!(csv.mime_pattern, "text/csv");
        assert_eq!(csv.mode, ChunkingMode::Lines);

        let plain = config.file_type_for("text/plain");
        assert_eq!(plain.mime_pattern, "text/*");

        let binary = config.file_type_for("application/octet-stream");
        assert_eq!(binary.mime_pattern, "other");
        assert_eq!(binary.mode, ChunkingMode::Size);
    }

    #[test]
    fn test_yaml_round_trip_with_partial_sections() {
        let yaml = r#"
chunk_size: 2097152
security:
  max_file_size: 10485760
  rate_limit:
    max_concurrent_uploads: 2
"#;
        let config: UploadConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.security.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.security.rate_limit.max_concurrent_uploads, 2);
        // Untouched sections fall back to defaults
        assert_eq!(config.concurrent_streams, 4);
        assert_eq!(config.security.rate_limit.max_requests_per_minute, 60);
        assert!(config.validate().is_ok());
    }
}
