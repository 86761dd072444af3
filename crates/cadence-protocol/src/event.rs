//! Lifecycle event taxonomy.
//!
//! Every event published on a context is wrapped in an [`EventEnvelope`]
//! carrying the common fields (timestamp, iteration, depth) so hooks never
//! need to query the context to place an event.

use crate::ids::{ContextId, EventId};
use crate::message::TokenUsage;
use crate::termination::TerminalReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fieldless discriminant used to register hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BeforeExecution,
    AfterExecution,
    BeforeIteration,
    AfterIteration,
    Compaction,
    ScratchpadReplaced,
    GenerationCompleted,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::BeforeExecution,
        EventType::AfterExecution,
        EventType::BeforeIteration,
        EventType::AfterIteration,
        EventType::Compaction,
        EventType::ScratchpadReplaced,
        EventType::GenerationCompleted,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeExecution => "before_execution",
            Self::AfterExecution => "after_execution",
            Self::BeforeIteration => "before_iteration",
            Self::AfterIteration => "after_iteration",
            Self::Compaction => "compaction",
            Self::ScratchpadReplaced => "scratchpad_replaced",
            Self::GenerationCompleted => "generation_completed",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    BeforeExecution {
        name: String,
    },
    AfterExecution {
        reason: TerminalReason,
        iterations: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BeforeIteration,
    AfterIteration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        finished: bool,
        /// The body's final result when it finished on this iteration.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Compaction {
        strategy: String,
        before_len: usize,
        after_len: usize,
        duration_ms: u64,
    },
    ScratchpadReplaced {
        before_len: usize,
        after_len: usize,
        removed: usize,
        added: usize,
    },
    GenerationCompleted {
        stream_id: String,
        purpose: String,
        usage: TokenUsage,
    },
    Custom {
        event_type: String,
        data: serde_json::Value,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::BeforeExecution { .. } => EventType::BeforeExecution,
            Self::AfterExecution { .. } => EventType::AfterExecution,
            Self::BeforeIteration => EventType::BeforeIteration,
            Self::AfterIteration { .. } => EventType::AfterIteration,
            Self::Compaction { .. } => EventType::Compaction,
            Self::ScratchpadReplaced { .. } => EventType::ScratchpadReplaced,
            Self::GenerationCompleted { .. } => EventType::GenerationCompleted,
            Self::Custom { .. } => EventType::Custom,
        }
    }

    pub fn custom(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Custom {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Common envelope around every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub context_id: ContextId,
    /// Position in the publishing node's own log, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub iteration: u64,
    pub depth: u32,
    pub kind: EventKind,
}

impl EventEnvelope {
    /// Envelope with a fresh id and the current timestamp. The sequence is
    /// assigned by the event log on append.
    pub fn new(context_id: ContextId, iteration: u64, depth: u32, kind: EventKind) -> Self {
        Self {
            event_id: EventId::default(),
            context_id,
            sequence: 0,
            timestamp: Utc::now(),
            iteration,
            depth,
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}
