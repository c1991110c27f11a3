//! Typed errors for the collaborator seams.
//!
//! Stage-local failures are values, not aborts: callers count them and move on.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

// A 429 or 5xx status as written by the loader, or a rate-limit phrase.
static RETRYABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bHTTP(?: status)?(?: (?:server|client) error)?\s*\(?(?:429|5\d\d)\b|too many requests|rate limit",
    )
    .unwrap()
});

/// Page loader failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page loader unavailable: {0}")]
    Unavailable(String),
    #[error("fetch failed for {url}: {reason}")]
    Failed { url: String, reason: String },
    #[error("no content returned for {url}")]
    Empty { url: String },
}

impl FetchError {
    /// Rate limits and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { reason, .. } => RETRYABLE_RE.is_match(reason),
            _ => false,
        }
    }
}

/// Enrichment lookup failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// Network, timeout, throttling or empty result.
    #[error("transient lookup failure: {0}")]
    Transient(String),
    /// Malformed response or rejected request.
    #[error("permanent lookup failure: {0}")]
    Permanent(String),
    #[error("lookup cancelled")]
    Cancelled,
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(format!("HTTP {}", status))
        } else {
            Self::Permanent(format!("HTTP {}", status))
        }
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_builder() {
            Self::Permanent(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("rename target '{target}' for '{original}' already exists")]
    RenameTargetExists { original: String, target: String },
    #[error("rename target '{target}' for '{original}' contains a disallowed substring")]
    DisallowedRenameTarget { original: String, target: String },
    #[error("rename target for '{original}' is empty")]
    EmptyRenameTarget { original: String },
}
