//! Shared error taxonomy
//!
//! Every component in the workspace classifies failures into one of the
//! kinds below instead of inventing its own error enum. The kind (not the
//! concrete type) is what the HTTP collaborator maps to a status code and
//! what the job/workflow retry logic inspects.

use serde::{Deserialize, Serialize};

/// The taxonomy from spec §7. `Conflict` is handled locally by callers (the
/// race loser re-reads or returns `None`) and should rarely escape a
/// persistence call as a propagated error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing/malformed input, unknown slug, unresolved template path.
    Validation,
    /// Entity in the wrong status for the requested transition.
    Precondition,
    /// Queue, database, or network I/O failure. Retryable.
    RetriableIo,
    /// A run/activity exceeded its timeout.
    Timeout,
    /// Optimistic-concurrency race lost to another worker.
    Conflict,
    /// Invariant violation: corrupt DAG, unknown status, etc.
    Fatal,
}

impl ErrorKind {
    /// Whether a job/step failure of this kind should be retried, subject to
    /// the retry policy's attempt budget.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RetriableIo)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Precondition => "precondition",
            ErrorKind::RetriableIo => "retriable_io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Bound applied to any message persisted into an `errorMessage` column so a
/// runaway error string cannot bloat a row indefinitely.
const MAX_ERROR_MESSAGE_LEN: usize = 4096;

/// The workspace-wide error type.
///
/// Carries enough context (kind, an optional code, and a safe summary) for
/// observability without leaking secrets or raw request bodies, per spec §7.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DockyardError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl DockyardError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: truncate(message.into()),
            code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn retriable_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetriableIo, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

fn truncate(message: String) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        message
    } else {
        let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        truncated.push_str("...[truncated]");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_io_is_retryable() {
        let err = DockyardError::retriable_io("connection reset");
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = DockyardError::validation("missing field x");
        assert!(!err.is_retryable());
    }

    #[test]
    fn long_message_is_truncated() {
        let long = "x".repeat(10_000);
        let err = DockyardError::fatal(long);
        assert!(err.message.len() <= MAX_ERROR_MESSAGE_LEN + 20);
        assert!(err.message.ends_with("...[truncated]"));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = DockyardError::precondition("build not succeeded");
        assert_eq!(err.to_string(), "precondition: build not succeeded");
    }
}
