//! Error classification and retry strategies
//!
//! Every chunk failure is routed through the [`ErrorClassifier`], which owns
//! the per-kind retry strategies and is the single source of truth for
//! whether an attempt is repeated and after how long. Errors produced by the
//! engine carry their kind in the `UploadError` variant; the string
//! heuristics in [`ErrorClassifier::classify_message`] are a fallback for
//! foreign error text only.

use crate::error::{ErrorKind, ErrorSeverity, UploadError};
use crate::models::epoch_ms;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum retained error reports
const ERROR_HISTORY_CAP: usize = 50;

/// Shape of the delay sequence between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffCurve {
    Immediate,
    Linear,
    Exponential,
    Fibonacci,
}

impl BackoffCurve {
    /// Delay before attempt `attempt` (1-indexed), capped at `max_delay`.
    ///
    /// - immediate: 0
    /// - linear: `base * k`
    /// - exponential: `base * 2^(k-1)`
    /// - fibonacci: `fib(k) * base`
    pub fn delay(&self, attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = base_delay.as_millis() as u64;

        let ms = match self {
            BackoffCurve::Immediate => 0,
            BackoffCurve::Linear => base_ms.saturating_mul(attempt as u64),
            BackoffCurve::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffCurve::Fibonacci => base_ms.saturating_mul(fibonacci(attempt)),
        };

        std::cmp::min(Duration::from_millis(ms), max_delay)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 1 {
        1
    } else {
        b
    }
}

/// Retry behavior for one error kind
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub curve: BackoffCurve,
    /// Retry is vetoed when the error message contains one of these markers
    pub skip_on: Vec<&'static str>,
    /// The error needs the caller to act; never retry automatically
    pub requires_user_action: bool,
}

impl RetryStrategy {
    fn no_retry() -> Self {
        RetryStrategy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            curve: BackoffCurve::Immediate,
            skip_on: Vec::new(),
            requires_user_action: false,
        }
    }
}

/// Default strategy table
fn default_strategies() -> HashMap<ErrorKind, RetryStrategy> {
    let mut map = HashMap::new();
    map.insert(
        ErrorKind::Network,
        RetryStrategy {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            curve: BackoffCurve::Exponential,
            skip_on: vec!["QUOTA_EXCEEDED", "PERMISSION_DENIED"],
            requires_user_action: false,
        },
    );
    map.insert(
        ErrorKind::Server,
        RetryStrategy {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(10),
            curve: BackoffCurve::Linear,
            skip_on: vec!["NOT_FOUND", "INVALID_ARGUMENT"],
            requires_user_action: false,
        },
    );
    map.insert(
        ErrorKind::Validation,
        RetryStrategy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
            curve: BackoffCurve::Immediate,
            skip_on: Vec::new(),
            // Validation failures need corrected input, not repetition
            requires_user_action: true,
        },
    );
    map.insert(
        ErrorKind::Storage,
        RetryStrategy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            curve: BackoffCurve::Exponential,
            skip_on: vec!["QUOTA_EXCEEDED"],
            requires_user_action: false,
        },
    );
    // Unknown errors are not retried automatically
    map.insert(ErrorKind::Unknown, RetryStrategy::no_retry());
    map
}

/// Where an error occurred, for severity assessment and reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorContext {
    pub file_id: String,
    pub chunk_index: Option<u32>,
    /// Attempts already failed for this operation
    pub retry_count: u32,
    pub is_recoverable: bool,
}

/// Outcome of consulting the classifier about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        RetryDecision {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Structured report delivered to error subscribers
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub context: ErrorContext,
    pub timestamp_ms: u64,
    pub recommendation: String,
}

/// Classifies errors, decides retries, and fans out reports
pub struct ErrorClassifier {
    strategies: HashMap<ErrorKind, RetryStrategy>,
    history: Mutex<VecDeque<ErrorReport>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ErrorReport>>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::with_strategies(default_strategies())
    }

    pub fn with_strategies(strategies: HashMap<ErrorKind, RetryStrategy>) -> Self {
        ErrorClassifier {
            strategies,
            history: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Build a classifier honoring the resumable config: the network
    /// strategy's base delay comes from `retry_delay_ms` and every strategy's
    /// attempt budget is capped at `max_retries`. The classifier remains the
    /// single owner of retry decisions.
    pub fn for_upload_config(resumable: &crate::config::ResumableConfig) -> Self {
        let mut strategies = default_strategies();
        if let Some(network) = strategies.get_mut(&ErrorKind::Network) {
            network.base_delay = Duration::from_millis(resumable.retry_delay_ms);
        }
        let mut classifier = Self::with_strategies(strategies);
        classifier.cap_retries(resumable.max_retries);
        classifier
    }

    /// Cap the attempt budget of every retryable strategy.
    ///
    /// Used to apply the resumable config's `max_retries` so the classifier
    /// stays the single place retry decisions come from.
    pub fn cap_retries(&mut self, cap: u32) {
        for strategy in self.strategies.values_mut() {
            strategy.max_retries = strategy.max_retries.min(cap);
        }
    }

    /// Keyword heuristics for errors that did not originate in this engine
    pub fn classify_message(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();

        if lower.contains("networkerror")
            || lower.contains("network")
            || lower.contains("offline")
            || lower.contains("connection")
        {
            ErrorKind::Network
        } else if lower.contains("server")
            || lower.trim_start().starts_with('5')
            || lower.contains("timeout")
        {
            ErrorKind::Server
        } else if lower.contains("validation") || lower.contains("invalid") || lower.contains("format")
        {
            ErrorKind::Validation
        } else if lower.contains("storage") || lower.contains("quota") || lower.contains("space") {
            ErrorKind::Storage
        } else {
            ErrorKind::Unknown
        }
    }

    /// Assess severity for an error occurrence
    pub fn assess_severity(kind: ErrorKind, context: &ErrorContext) -> ErrorSeverity {
        if !context.is_recoverable || context.retry_count >= 5 {
            ErrorSeverity::Critical
        } else if kind == ErrorKind::Network && context.retry_count < 3 {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }

    /// User-facing recommendation per error kind
    pub fn recommendation(kind: ErrorKind) -> &'static str {
        match kind {
            ErrorKind::Network => "Check your network connection and try again",
            ErrorKind::Server => "The server is having trouble; try again later",
            ErrorKind::Validation => "Check the file and upload settings",
            ErrorKind::Storage => "Free up space and try again",
            ErrorKind::Unknown => "An unexpected error occurred",
        }
    }

    /// Decide whether the failed operation should be retried and record the
    /// occurrence.
    ///
    /// The decision combines the error's transience, the kind's strategy
    /// (attempt cap, skip markers, user-action flag) and the backoff curve.
    /// `context.retry_count` is the number of attempts that already failed.
    pub fn handle_error(&self, error: &UploadError, context: &ErrorContext) -> RetryDecision {
        let kind = error.kind();
        let message = error.to_string();
        let severity = Self::assess_severity(kind, context);

        let report = ErrorReport {
            error: message.clone(),
            kind,
            severity,
            context: context.clone(),
            timestamp_ms: epoch_ms(),
            recommendation: Self::recommendation(kind).to_string(),
        };
        self.record(report);

        let Some(strategy) = self.strategies.get(&kind) else {
            return RetryDecision::stop();
        };

        if strategy.requires_user_action || error.requires_user_action() {
            debug!("{} error requires user action, not retrying", kind);
            return RetryDecision::stop();
        }

        if !error.is_transient() {
            return RetryDecision::stop();
        }

        let upper = message.to_uppercase();
        if strategy.skip_on.iter().any(|marker| upper.contains(marker)) {
            warn!("retry vetoed by skip condition for {} error", kind);
            return RetryDecision::stop();
        }

        if context.retry_count >= strategy.max_retries {
            return RetryDecision::stop();
        }

        let attempt = context.retry_count + 1;
        RetryDecision {
            should_retry: true,
            delay: strategy
                .curve
                .delay(attempt, strategy.base_delay, strategy.max_delay),
        }
    }

    fn record(&self, report: ErrorReport) {
        {
            let mut history = self.history.lock().unwrap();
            if history.len() >= ERROR_HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(report.clone());
        }

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(report.clone()).is_ok());
    }

    /// Subscribe to every future error report
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ErrorReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Most recent error reports, oldest first (bounded at 50)
    pub fn recent_errors(&self) -> Vec<ErrorReport> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}
