//! Security gate: file validation, chunk encryption, rate limiting and
//! access tokens
//!
//! One gate instance is shared by every upload flow; its tables are behind
//! mutexes and safe for concurrent use.

use crate::config::{AccessControlConfig, SecurityConfig};
use crate::error::{Result, UploadError};
use crate::models::{epoch_ms, FileInfo};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// AES-GCM nonce length in bytes; the wire format is `IV ‖ ciphertext`
const NONCE_LEN: usize = 12;

/// How many leading bytes are compared against the magic table
const SIGNATURE_PROBE_LEN: usize = 50;

/// Window size for the suspicious-header scan
const SCAN_WINDOW: usize = 1024 * 1024; // 1MB

/// Magic-byte table for known MIME types
const MAGIC_TABLE: &[(&str, &[u8])] = &[
    ("image/jpeg", &[0xFF, 0xD8, 0xFF]),
    ("image/png", &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
    ("image/gif", &[0x47, 0x49, 0x46, 0x38]),
    ("application/pdf", &[0x25, 0x50, 0x44, 0x46]),
];

/// Headers that mark a window as suspicious
const SUSPICIOUS_HEADERS: &[&[u8]] = &[
    &[0x4D, 0x5A],             // MZ (PE executable)
    &[0x7F, 0x45, 0x4C, 0x46], // ELF
];

/// Outcome of file validation, accumulating every failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// One issued access token
#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    issued_ms: u64,
}

#[derive(Default)]
struct RateWindow {
    /// Admission times inside the sliding window
    requests: VecDeque<Instant>,
    /// Currently running uploads
    concurrent: u32,
}

/// Shared security gate
pub struct SecurityGate {
    config: SecurityConfig,
    /// Per-file encryption keys, created at upload start
    keys: Mutex<HashMap<String, Vec<u8>>>,
    /// Per-user sliding windows and concurrency counters
    rate: Mutex<HashMap<String, RateWindow>>,
    /// Per-user active tokens
    tokens: Mutex<HashMap<String, Vec<AccessToken>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper_cancel: CancellationToken,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        SecurityGate {
            config,
            keys: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            sweeper_cancel: CancellationToken::new(),
        }
    }

    // ------------------------------------------------------------------
    // File validation
    // ------------------------------------------------------------------

    /// Validate a file against the configured policy, accumulating all
    /// failures rather than stopping at the first.
    pub async fn validate_file(&self, file: &FileInfo) -> Result<FileValidation> {
        let mut errors = Vec::new();

        if file.size > self.config.max_file_size {
            errors.push(format!(
                "file size {} exceeds the maximum of {} bytes",
                file.size, self.config.max_file_size
            ));
        }

        if !mime_allowed(&file.mime_type, &self.config.allowed_mime_types) {
            errors.push(format!("MIME type '{}' is not allowed", file.mime_type));
        }

        if !extension_allowed(&file.name, &self.config.allowed_extensions) {
            errors.push(format!("file extension of '{}' is not allowed", file.name));
        }

        if self.config.validate_file_signature {
            if let Err(msg) = self.check_signature(file).await {
                errors.push(msg);
            }
        }

        if self.config.enable_virus_scan {
            if let Err(msg) = self.scan_for_suspicious_headers(file).await {
                errors.push(msg);
            }
        }

        let validation = FileValidation {
            is_valid: errors.is_empty(),
            errors,
        };
        if !validation.is_valid {
            warn!(
                "file {} failed validation: {}",
                file.name,
                validation.errors.join("; ")
            );
        }
        Ok(validation)
    }

    /// Compare the file's leading bytes against the magic table.
    ///
    /// MIME types without a table entry pass vacuously.
    async fn check_signature(&self, file: &FileInfo) -> std::result::Result<(), String> {
        let Some((_, magic)) = MAGIC_TABLE
            .iter()
            .find(|(mime, _)| *mime == file.mime_type)
        else {
            return Ok(());
        };

        let mut handle = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| format!("could not read file for signature check: {}", e))?;
        let mut head = vec![0u8; SIGNATURE_PROBE_LEN];
        let n = read_up_to(&mut handle, &mut head)
            .await
            .map_err(|e| format!("could not read file for signature check: {}", e))?;
        head.truncate(n);

        if head.len() < magic.len() || &head[..magic.len()] != *magic {
            return Err(format!(
                "file signature does not match declared MIME type '{}'",
                file.mime_type
            ));
        }
        Ok(())
    }

    /// Stream the file in 1MB windows and reject when a window starts with a
    /// suspicious executable header.
    async fn scan_for_suspicious_headers(&self, file: &FileInfo) -> std::result::Result<(), String> {
        let mut handle = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| format!("could not read file for scanning: {}", e))?;

        let mut window = vec![0u8; SCAN_WINDOW];
        let mut offset = 0u64;
        loop {
            let n = read_up_to(&mut handle, &mut window)
                .await
                .map_err(|e| format!("could not read file for scanning: {}", e))?;
            if n == 0 {
                return Ok(());
            }

            if SUSPICIOUS_HEADERS
                .iter()
                .any(|header| n >= header.len() && &window[..header.len()] == *header)
            {
                return Err(format!(
                    "suspicious executable header at offset {}",
                    offset
                ));
            }
            offset += n as u64;
        }
    }

    // ------------------------------------------------------------------
    // Chunk encryption
    // ------------------------------------------------------------------

    /// Whether chunk encryption is configured on
    pub fn encryption_enabled(&self) -> bool {
        self.config.encryption.enabled
    }

    /// Generate and bind a fresh key for a file. No-op when encryption is
    /// disabled.
    pub fn create_encryption_key(&self, file_id: &str) -> Result<()> {
        if !self.config.encryption.enabled {
            return Ok(());
        }

        let key_len = match self.config.encryption.key_size {
            128 => 16,
            256 => 32,
            other => {
                return Err(UploadError::Encryption(format!(
                    "unsupported key size {}",
                    other
                )))
            }
        };

        let mut key = vec![0u8; key_len];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.keys.lock().unwrap().insert(file_id.to_string(), key);
        debug!("created {}-bit key for file {}", key_len * 8, file_id);
        Ok(())
    }

    /// Destroy the key bound to a file; called on terminal status
    pub fn destroy_encryption_key(&self, file_id: &str) {
        if self.keys.lock().unwrap().remove(file_id).is_some() {
            debug!("destroyed encryption key for file {}", file_id);
        }
    }

    /// True when a key is bound to this file
    pub fn has_encryption_key(&self, file_id: &str) -> bool {
        self.keys.lock().unwrap().contains_key(file_id)
    }

    /// Encrypt a chunk payload with the file's key. Output is
    /// `IV ‖ ciphertext` with a fresh 12-byte IV per chunk.
    pub fn encrypt_chunk(&self, file_id: &str, plaintext: &[u8]) -> Result<Bytes> {
        let key = self
            .keys
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| {
                UploadError::Encryption(format!("no key bound to file {}", file_id))
            })?;

        let mut iv = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = match key.len() {
            16 => Aes128Gcm::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .encrypt(nonce, plaintext),
            32 => Aes256Gcm::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .encrypt(nonce, plaintext),
            n => {
                return Err(UploadError::Encryption(format!(
                    "invalid key length {}",
                    n
                )))
            }
        }
        .map_err(|_| UploadError::Encryption("AES-GCM encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(Bytes::from(out))
    }

    /// Reverse `encrypt_chunk`: split off the leading IV and decrypt
    pub fn decrypt_chunk(&self, file_id: &str, data: &[u8]) -> Result<Bytes> {
        if data.len() < NONCE_LEN {
            return Err(UploadError::Encryption(
                "ciphertext shorter than the IV".into(),
            ));
        }
        let key = self
            .keys
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| {
                UploadError::Encryption(format!("no key bound to file {}", file_id))
            })?;

        let (iv, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(iv);

        let plaintext = match key.len() {
            16 => Aes128Gcm::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .decrypt(nonce, ciphertext),
            32 => Aes256Gcm::new_from_slice(&key)
                .map_err(|e| UploadError::Encryption(e.to_string()))?
                .decrypt(nonce, ciphertext),
            n => {
                return Err(UploadError::Encryption(format!(
                    "invalid key length {}",
                    n
                )))
            }
        }
        .map_err(|_| UploadError::Encryption("AES-GCM decryption failed".into()))?;

        Ok(Bytes::from(plaintext))
    }

    // ------------------------------------------------------------------
    // Rate limiting
    // ------------------------------------------------------------------

    /// Admit a new upload for a user, or reject when either the sliding
    /// window or the concurrency bound is exhausted. Admission counts
    /// against both.
    pub fn check_rate_limit(&self, user_id: &str) -> Result<()> {
        if !self.config.rate_limit.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let window = Duration::from_secs(60);
        let mut rate = self.rate.lock().unwrap();
        let entry = rate.entry(user_id.to_string()).or_default();

        while entry
            .requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            entry.requests.pop_front();
        }

        if entry.requests.len() as u32 >= self.config.rate_limit.max_requests_per_minute {
            return Err(UploadError::RateLimited(format!(
                "user {} exceeded {} requests per minute",
                user_id, self.config.rate_limit.max_requests_per_minute
            )));
        }

        if entry.concurrent >= self.config.rate_limit.max_concurrent_uploads {
            return Err(UploadError::RateLimited(format!(
                "user {} already has {} concurrent uploads",
                user_id, entry.concurrent
            )));
        }

        entry.requests.push_back(now);
        entry.concurrent += 1;
        Ok(())
    }

    /// Release one concurrency slot; the sliding window is unaffected
    pub fn release_rate_limit(&self, user_id: &str) {
        let mut rate = self.rate.lock().unwrap();
        if let Some(entry) = rate.get_mut(user_id) {
            entry.concurrent = entry.concurrent.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // Access tokens
    // ------------------------------------------------------------------

    /// Issue a token of the form `"{userId}:{uuid}:{epochMs}"`, evicting the
    /// user's oldest token beyond the per-user cap.
    pub fn issue_token(&self, user_id: &str) -> String {
        let issued_ms = epoch_ms();
        let token = format!("{}:{}:{}", user_id, uuid::Uuid::new_v4(), issued_ms);

        let mut tokens = self.tokens.lock().unwrap();
        let list = tokens.entry(user_id.to_string()).or_default();
        list.push(AccessToken {
            token: token.clone(),
            issued_ms,
        });

        let cap = self.config.access_control.max_tokens_per_user.max(1);
        while list.len() > cap {
            list.remove(0);
            info!("evicted oldest token for user {}", user_id);
        }

        token
    }

    /// A token is valid iff it is in the active set and younger than the
    /// configured expiration. When access control is disabled every token
    /// passes.
    pub fn validate_token(&self, token: &str) -> bool {
        if !self.config.access_control.enabled {
            return true;
        }

        let Some(user_id) = token.split(':').next() else {
            return false;
        };

        let tokens = self.tokens.lock().unwrap();
        let Some(list) = tokens.get(user_id) else {
            return false;
        };
        let Some(entry) = list.iter().find(|t| t.token == token) else {
            return false;
        };

        let age_ms = epoch_ms().saturating_sub(entry.issued_ms);
        age_ms < self.config.access_control.token_expiration_secs * 1000
    }

    /// Remove one token from the active set
    pub fn revoke_token(&self, token: &str) -> bool {
        let Some(user_id) = token.split(':').next() else {
            return false;
        };
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(list) = tokens.get_mut(user_id) {
            let before = list.len();
            list.retain(|t| t.token != token);
            return list.len() < before;
        }
        false
    }

    /// Drop every expired token from the active set
    pub fn purge_expired_tokens(&self) -> usize {
        let ttl_ms = self.config.access_control.token_expiration_secs * 1000;
        let now = epoch_ms();
        let mut purged = 0;

        let mut tokens = self.tokens.lock().unwrap();
        for list in tokens.values_mut() {
            let before = list.len();
            list.retain(|t| now.saturating_sub(t.issued_ms) < ttl_ms);
            purged += before - list.len();
        }
        tokens.retain(|_, list| !list.is_empty());
        purged
    }

    /// Start the timer that deletes expired tokens.
    ///
    /// Validation already enforces expiry; the sweeper bounds how long an
    /// expired token stays in memory. The interval is derived from the
    /// configured (always positive) expiration.
    pub fn start_token_sweeper(self: &Arc<Self>) {
        if !self.config.access_control.enabled {
            return;
        }
        let mut guard = self.sweeper.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let gate = Arc::clone(self);
        let cancel = self.sweeper_cancel.clone();
        let period = Duration::from_secs(self.config.access_control.token_expiration_secs.clamp(1, 60));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = gate.purge_expired_tokens();
                        if purged > 0 {
                            debug!("token sweeper purged {} expired tokens", purged);
                        }
                    }
                }
            }
        }));
    }

    /// Stop the expiry sweeper
    pub fn stop_token_sweeper(&self) {
        self.sweeper_cancel.cancel();
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for SecurityGate {
    fn drop(&mut self) {
        self.sweeper_cancel.cancel();
    }
}

fn mime_allowed(mime: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|pattern| {
        if pattern == "*" || pattern == "*/*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return mime.split('/').next() == Some(prefix);
        }
        pattern.eq_ignore_ascii_case(mime)
    })
}

fn extension_allowed(name: &str, allowed: &[String]) -> bool {
    if allowed.iter().any(|e| e == "*") {
        return true;
    }
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    allowed.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Read as many bytes as fit into `buf`, stopping early only at EOF
async fn read_up_to(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
