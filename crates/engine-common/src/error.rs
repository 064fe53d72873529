//! The closed error-kind set from spec §7, plus the `EngineError` wrapper
//! used across every crate's public `Result`s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of terminal/propagated error kinds (spec §7). Names are
/// contracts: callers match on `ErrorKind`, not on crate-specific error enums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserCodeFailure,
    Timeout,
    MemoryLimit,
    Cancelled,
    WorkerCrashed,
    WorkerLost,
    ImportDenied,
    Overloaded,
    LogPersistenceDegraded,
    Undeliverable,
    IllegalTransition,
}

impl ErrorKind {
    /// Infrastructure-level failures are retried by the dispatcher up to
    /// `run.max_redeliveries`; user-level failures are terminal (spec §4.5).
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Overloaded)
    }

    pub fn is_warning(self) -> bool {
        matches!(self, ErrorKind::LogPersistenceDegraded)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::UserCodeFailure => "user_code_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MemoryLimit => "memory_limit",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::WorkerLost => "worker_lost",
            ErrorKind::ImportDenied => "import_denied",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::LogPersistenceDegraded => "log_persistence_degraded",
            ErrorKind::Undeliverable => "undeliverable",
            ErrorKind::IllegalTransition => "illegal_transition",
        };
        write!(f, "{s}")
    }
}

/// A terminal or propagated engine error: a classified kind plus a
/// human-readable message (spec §7, "every terminal run carries one kind and
/// a human-readable message"). Optionally carries a traceback for
/// `UserCodeFailure`.
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalTransition, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }
}
