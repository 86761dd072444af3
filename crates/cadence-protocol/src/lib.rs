//! # cadence-protocol: shared contract for the Cadence runtime
//!
//! Types shared by every Cadence crate. Intentionally free of async runtime
//! dependencies so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: typed ID wrappers (ContextId, EventId)
//! - [`event`]: EventEnvelope, EventKind, EventType
//! - [`iteration`]: scratchpad items and their metadata
//! - [`limit`]: Limit declarations and key matching
//! - [`message`]: messages, content parts, token usage, generation requests
//! - [`termination`]: ExecutionState, TerminalReason
//! - [`keys`]: reserved and well-known stat keys
//! - [`error`]: CadenceError, CadenceResult

pub mod error;
pub mod event;
pub mod ids;
pub mod iteration;
pub mod keys;
pub mod limit;
pub mod message;
pub mod termination;

pub use error::{CadenceError, CadenceResult};
pub use event::{EventEnvelope, EventKind, EventType};
pub use ids::{ContextId, EventId};
pub use iteration::{Iteration, IterationMetadata, Origin, PIN_IMPORTANCE};
pub use limit::{KeyMatch, Limit};
pub use message::{ContentPart, Generation, GenerationRequest, Message, Role, TokenUsage};
pub use termination::{ExecutionState, TerminalReason};
