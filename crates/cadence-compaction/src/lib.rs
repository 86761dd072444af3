//! Concrete compaction triggers and strategies.
//!
//! - [`trigger`]: counter-delta, gauge-threshold and composite triggers
//! - [`window`]: sliding window over unpinned scratchpad items
//! - [`summarize`]: progressive summarization through the generative port

pub mod summarize;
pub mod trigger;
pub mod window;

pub use summarize::{Summarization, SummarizationConfig};
pub use trigger::{AnyTrigger, CounterTrigger, GaugeTrigger};
pub use window::SlidingWindow;
