//! Error types for the upload engine

use thiserror::Error;

/// Result type alias for upload operations
pub type Result<T> = std::result::Result<T, UploadError>;

/// Error types that can occur while driving an upload
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("chunking error: {0}")]
    Chunking(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("memory budget exceeded: {0}")]
    MemoryBudget(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout(err.to_string())
        } else {
            UploadError::Network(err.to_string())
        }
    }
}

/// Coarse error taxonomy used by the retry strategies and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Server,
    Validation,
    Storage,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Severity assessed for an error occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl UploadError {
    /// Map this error to its taxonomy kind.
    ///
    /// Errors produced by the engine itself carry their kind in the variant;
    /// string heuristics are only applied to foreign error text (see
    /// `ErrorClassifier::classify_message`).
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Network(_) => ErrorKind::Network,

            // Timeouts are treated as a server-side condition
            UploadError::Server { .. } => ErrorKind::Server,
            UploadError::Timeout(_) => ErrorKind::Server,

            UploadError::Validation(_) => ErrorKind::Validation,
            UploadError::Config(_) => ErrorKind::Validation,
            UploadError::Chunking(_) => ErrorKind::Validation,
            UploadError::AccessDenied(_) => ErrorKind::Validation,

            UploadError::Storage(_) => ErrorKind::Storage,
            UploadError::IoError(_) => ErrorKind::Storage,
            UploadError::MemoryBudget(_) => ErrorKind::Storage,

            UploadError::RateLimited(_) => ErrorKind::Unknown,
            UploadError::Compression(_) => ErrorKind::Unknown,
            UploadError::Encryption(_) => ErrorKind::Unknown,
            UploadError::Worker(_) => ErrorKind::Unknown,
            UploadError::Cancelled => ErrorKind::Unknown,
            UploadError::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Determine if this error is potentially transient.
    ///
    /// Returns true for errors that may succeed on retry:
    /// - network failures and timeouts
    /// - 5xx responses from the sink
    /// - IO and storage errors
    ///
    /// Returns false for errors that are permanent:
    /// - validation and configuration errors
    /// - 4xx responses from the sink
    /// - cancellation
    ///
    /// The retry strategies in `retry` combine this with per-kind attempt
    /// caps and skip conditions; this method alone never drives a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            UploadError::Network(_) => true,
            UploadError::Timeout(_) => true,
            UploadError::Server { status, .. } => *status >= 500,
            UploadError::IoError(_) => true,
            UploadError::Storage(_) => true,
            UploadError::Worker(_) => true,

            UploadError::Validation(_) => false,
            UploadError::Config(_) => false,
            UploadError::Chunking(_) => false,
            UploadError::AccessDenied(_) => false,
            UploadError::RateLimited(_) => false,
            UploadError::Compression(_) => false,
            UploadError::Encryption(_) => false,
            UploadError::MemoryBudget(_) => false,
            UploadError::Cancelled => false,
            UploadError::Internal(_) => false,
        }
    }

    /// True when resolving this error needs the caller to act (fix input,
    /// free up space, re-authenticate) rather than the engine retrying.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            UploadError::Validation(_)
                | UploadError::Config(_)
                | UploadError::AccessDenied(_)
                | UploadError::MemoryBudget(_)
        )
    }

    /// Create a Server error from an HTTP status code and status text
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        UploadError::Server {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            UploadError::Network("offline".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            UploadError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .kind(),
            ErrorKind::Server
        );
        assert_eq!(
            UploadError::Timeout("30s elapsed".into()).kind(),
            ErrorKind::Server
        );
        assert_eq!(
            UploadError::Validation("bad mime".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            UploadError::Storage("quota".into()).kind(),
            ErrorKind::Storage
        );
        assert_eq!(UploadError::Cancelled.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_transient_5xx_but_not_4xx() {
        let e5 = UploadError::from_http_status(502, "bad gateway");
        let e4 = UploadError::from_http_status(404, "not found");
        assert!(e5.is_transient());
        assert!(!e4.is_transient());
    }

    #[test]
    fn test_cancelled_is_final() {
        assert!(!UploadError::Cancelled.is_transient());
        assert!(!UploadError::Cancelled.requires_user_action());
    }

    #[test]
    fn test_user_action_errors() {
        assert!(UploadError::Validation("size".into()).requires_user_action());
        assert!(!UploadError::Network("offline".into()).requires_user_action());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: UploadError = io.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
