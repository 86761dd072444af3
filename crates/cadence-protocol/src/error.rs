//! Error types for misuse of the runtime contract.

use thiserror::Error;

/// Programmer-misuse errors. None of these are retried; they indicate a
/// caller broke an invariant of the runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CadenceError {
    #[error("negative counter delta {delta} for key {key}")]
    NegativeDelta { key: String, delta: i64 },
    #[error("key is in the reserved local-only namespace: {0}")]
    ReservedKey(String),
    #[error("compaction is already configured for this context")]
    CompactionAlreadyConfigured,
    #[error("terminal record already set")]
    TerminalAlreadyRecorded,
    #[error("execution already started for context {0}")]
    ExecutionAlreadyStarted(String),
    #[error("context {0} is finalized and cannot be reused")]
    ContextFinalized(String),
    #[error("template error: {0}")]
    Template(String),
}

/// Convenience result type for runtime operations.
pub type CadenceResult<T> = Result<T, CadenceError>;
