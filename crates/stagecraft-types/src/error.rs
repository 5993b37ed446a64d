use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a task failure.
///
/// Retry policies decide per kind whether another attempt is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network hiccup, rate limit, upstream 5xx.
    Transient,
    /// Invalid input, auth failure, missing resource.
    Permanent,
    /// The per-attempt deadline elapsed.
    Timeout,
    /// Cooperative cancellation was honored.
    Cancelled,
    /// Admission was refused by the budget ledger.
    BudgetExhausted,
    /// Replayed history diverged from the current run.
    ReplayMismatch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::ReplayMismatch => "replay_mismatch",
        };
        write!(f, "{s}")
    }
}

/// The error record of a single task attempt.
///
/// Agents report `retryable` themselves; the engine never looks at payloads,
/// only at `kind` and `retryable`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message, true)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message, true)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled", false)
    }
}

/// Errors from repository operations (used by trait definitions in stagecraft-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError::transient("connection reset");
        assert_eq!(err.to_string(), "transient: connection reset");
        assert!(err.retryable);
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        let err = TaskError::permanent("bad input");
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert!(!err.retryable);
    }

    #[test]
    fn test_error_kind_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BudgetExhausted).unwrap();
        assert_eq!(json, "\"budget_exhausted\"");
        let kind: ErrorKind = serde_json::from_str("\"replay_mismatch\"").unwrap();
        assert_eq!(kind, ErrorKind::ReplayMismatch);
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
