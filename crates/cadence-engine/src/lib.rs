//! # cadence-engine
//!
//! The execution core: a tree of [`ExecutionContext`] nodes, each owning a
//! [`Stats`] node that aggregates counters into its ancestors, and the
//! [`Executor`] that drives a [`LoopBody`] through the iteration algorithm
//! with limits, compaction and cancellation.

pub mod compaction;
pub mod config;
pub mod context;
pub mod data;
pub mod executor;
pub mod generative;
pub mod limits;
pub mod stats;

pub use compaction::{CompactionStrategy, CompactionTrigger};
pub use config::ExecutorConfig;
pub use context::{CompactionConfig, ExecutionContext, ExecutionError, TerminalRecord};
pub use data::{DataStore, InMemoryData};
pub use executor::{Executor, LoopBody, Step};
pub use generative::GenerativePort;
pub use stats::{Stats, StatsSnapshot};
