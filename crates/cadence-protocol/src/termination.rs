//! Execution lifecycle and termination reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one execution context. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    NotStarted,
    Running,
    Terminated,
}

/// Why an execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Success,
    Error,
    ContextCancelled,
    HookAbort,
    LimitExceeded,
    CompactionFailed,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::ContextCancelled => "context_cancelled",
            Self::HookAbort => "hook_abort",
            Self::LimitExceeded => "limit_exceeded",
            Self::CompactionFailed => "compaction_failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
