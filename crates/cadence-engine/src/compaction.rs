//! Trigger and strategy seams the executor drives between iterations.

use async_trait::async_trait;

use crate::context::ExecutionContext;

/// Decides when the scratchpad should be compacted.
///
/// Triggers may carry snapshot state behind interior mutability, so one
/// instance should not be shared across independent executions.
pub trait CompactionTrigger: Send + Sync {
    fn should_compact(&self, ctx: &ExecutionContext) -> bool;
    /// Called after a strategy succeeded and its event was published.
    fn notify_compacted(&self, ctx: &ExecutionContext);
}

/// Computes a full replacement scratchpad and installs it through
/// [`ExecutionContext::set_scratchpad`].
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn compact(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}
