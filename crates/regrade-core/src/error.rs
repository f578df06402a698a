//! Error types for regrade-core
//!
//! `CoreError` carries the failure taxonomy of a run. Per-thread failures are
//! collected into a `RunReport` instead of being raised, so a run degrades
//! gracefully and only authentication or cache initialization stop it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a fetch failed in a way that may succeed on a later attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientKind {
    /// Connection reset, DNS failure, TLS error...
    Network(String),
    /// Per-call timeout exceeded
    Timeout(Duration),
    /// HTTP 429 from the platform
    RateLimited,
    /// Unexpected HTTP status (5xx, 404 on a moved page...)
    Status(u16),
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Network(msg) => write!(f, "network error: {}", msg),
            TransientKind::Timeout(d) => write!(f, "timed out after {}s", d.as_secs_f32()),
            TransientKind::RateLimited => write!(f, "rate limited"),
            TransientKind::Status(code) => write!(f, "HTTP status {}", code),
        }
    }
}

/// Core error type for regrade operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // IO Errors
    // ===================
    #[error("Failed to read file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON in {path}: {message}")]
    JsonParse {
        path: PathBuf,
        message: String,
        #[source]
        source: serde_json::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Not a regrade request URL: {url} (expected .../courses/<id>/assignments/<id>)")]
    InvalidAssignmentUrl { url: String },

    // ===================
    // Session Errors
    // ===================
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ===================
    // Fetch Errors
    // ===================
    #[error("Transient failure fetching {url}: {kind}")]
    TransientFetch { url: String, kind: TransientKind },

    #[error("Unexpected page layout at {url}: {message}")]
    Parse { url: String, message: String },

    // ===================
    // Cache Errors
    // ===================
    #[error("Failed to open regrade cache at {path}: {message}")]
    CacheInit { path: PathBuf, message: String },

    #[error("Failed to write cache entry {key}: {message}")]
    CacheWrite { key: String, message: String },

    // ===================
    // Classification
    // ===================
    #[error("Outcome classification unavailable: {reason}")]
    ClassificationUnavailable { reason: String },
}

impl CoreError {
    pub fn authentication(message: impl Into<String>) -> Self {
        CoreError::Authentication {
            message: message.into(),
        }
    }

    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Parse {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn transient(url: impl Into<String>, kind: TransientKind) -> Self {
        CoreError::TransientFetch {
            url: url.into(),
            kind,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        CoreError::ClassificationUnavailable {
            reason: reason.into(),
        }
    }

    /// Map a reqwest failure onto the transient taxonomy
    pub fn from_reqwest(url: impl Into<String>, err: &reqwest::Error, timeout: Duration) -> Self {
        let kind = if err.is_timeout() {
            TransientKind::Timeout(timeout)
        } else if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                TransientKind::RateLimited
            } else {
                TransientKind::Status(status.as_u16())
            }
        } else {
            TransientKind::Network(err.to_string())
        };
        CoreError::transient(url, kind)
    }

    /// Errors that stop the whole run before any fetching happens
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Authentication { .. }
                | CoreError::CacheInit { .. }
                | CoreError::InvalidConfig { .. }
                | CoreError::InvalidAssignmentUrl { .. }
        )
    }

    /// Errors the fetcher retries. Parse errors are retried too: the retry is
    /// cheap and a half-rendered page occasionally parses on the second try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientFetch { .. } | CoreError::Parse { .. }
        )
    }
}

/// Severity level for issues recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Non-critical, run continues with degraded output
    Warning,
    /// One thread or stage lost, run continues
    Error,
    /// Run cannot continue
    Fatal,
}

/// Individual entry in a run report
#[derive(Debug, Clone)]
pub struct RunIssue {
    pub source: String,
    pub message: String,
    pub severity: ErrorSeverity,
    /// Actionable suggestion for the operator (optional)
    pub suggestion: Option<String>,
}

impl RunIssue {
    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            severity: ErrorSeverity::Warning,
            suggestion: None,
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            severity: ErrorSeverity::Error,
            suggestion: None,
        }
    }

    pub fn fatal(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            severity: ErrorSeverity::Fatal,
            suggestion: None,
        }
    }

    /// Build a user-facing issue from a CoreError with context-aware suggestions
    pub fn from_core_error(source: impl Into<String>, error: &CoreError) -> Self {
        let source = source.into();
        let severity = if error.is_fatal() {
            ErrorSeverity::Fatal
        } else {
            match error {
                CoreError::CacheWrite { .. } | CoreError::ClassificationUnavailable { .. } => {
                    ErrorSeverity::Warning
                }
                _ => ErrorSeverity::Error,
            }
        };
        let suggestion = match error {
            CoreError::Authentication { .. } => Some(
                "Check GRADESCOPE_EMAIL / GRADESCOPE_PASSWORD, or delete the cookie file"
                    .to_string(),
            ),
            CoreError::Parse { .. } => Some(
                "The platform layout may have changed; re-run with --verbose to inspect"
                    .to_string(),
            ),
            CoreError::TransientFetch {
                kind: TransientKind::RateLimited,
                ..
            } => Some("Lower parallelism with -p".to_string()),
            CoreError::CacheWrite { .. } => {
                Some("Check free space and permissions of the cache directory".to_string())
            }
            CoreError::ClassificationUnavailable { .. } => Some(
                "Start the entailment inference server or pass --no-classify".to_string(),
            ),
            _ => None,
        };

        Self {
            source,
            message: error.to_string(),
            severity,
            suggestion,
        }
    }
}

/// Report of what happened during a pipeline run
///
/// Always returned to the caller, never raised: per-thread failures land here
/// as issues and counters.
#[derive(Debug, Default)]
pub struct RunReport {
    pub issues: Vec<RunIssue>,
    /// Listing rows seen (one per submitted comment)
    pub listed: usize,
    /// Distinct threads after deduplication
    pub threads: usize,
    /// Threads served from the cache
    pub cached: usize,
    /// Threads fetched from the platform in this run
    pub fetched: usize,
    /// Threads that exhausted their retries
    pub failed: usize,
    /// Cache writes that did not make it to disk
    pub cache_write_failures: usize,
    /// Records that received an outcome in this run
    pub classified: usize,
    /// False when classification was disabled or the model was unavailable
    pub outcomes_computed: bool,
    /// False when listing traversal stopped before the end-of-list marker
    pub listing_complete: bool,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            listing_complete: true,
            ..Self::default()
        }
    }

    pub fn add_issue(&mut self, issue: RunIssue) {
        self.issues.push(issue);
    }

    pub fn add_warning(&mut self, source: impl Into<String>, message: impl Into<String>) {
        self.issues.push(RunIssue::warning(source, message));
    }

    pub fn add_error(&mut self, source: impl Into<String>, message: impl Into<String>) {
        self.issues.push(RunIssue::error(source, message));
    }

    /// Record a thread that could not be fetched
    pub fn record_failure(&mut self, source: impl Into<String>, error: &CoreError) {
        self.failed += 1;
        self.issues.push(RunIssue::from_core_error(source, error));
    }

    /// Record a cache write that failed; the record stays in memory only
    pub fn record_cache_write_failure(&mut self, error: &CoreError) {
        self.cache_write_failures += 1;
        self.issues.push(RunIssue::from_core_error("cache", error));
    }

    /// Returns true if every record written this run reached the cache
    pub fn persisted(&self) -> bool {
        self.cache_write_failures == 0
    }

    /// Returns true if there are any fatal issues
    pub fn has_fatal_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|e| e.severity == ErrorSeverity::Fatal)
    }

    /// Returns only warnings
    pub fn warnings(&self) -> impl Iterator<Item = &RunIssue> {
        self.issues
            .iter()
            .filter(|e| e.severity == ErrorSeverity::Warning)
    }

    /// Returns count by severity: (warnings, errors, fatal)
    pub fn issue_count(&self) -> (usize, usize, usize) {
        let count = |sev: ErrorSeverity| self.issues.iter().filter(|e| e.severity == sev).count();
        (
            count(ErrorSeverity::Warning),
            count(ErrorSeverity::Error),
            count(ErrorSeverity::Fatal),
        )
    }
}
