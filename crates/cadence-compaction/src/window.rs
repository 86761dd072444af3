use async_trait::async_trait;
use cadence_engine::{CompactionStrategy, ExecutionContext};
use tracing::debug;

/// Keeps the most recent `size` unpinned items.
///
/// Pinned items survive unconditionally and do not count against the window.
/// Survivors keep their original relative order.
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindow {
    size: usize,
}

impl SlidingWindow {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[async_trait]
impl CompactionStrategy for SlidingWindow {
    fn name(&self) -> &str {
        "sliding_window"
    }

    async fn compact(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let items = ctx.scratchpad();
        let unpinned = items.iter().filter(|item| !item.is_pinned()).count();
        if unpinned <= self.size {
            debug!(unpinned, window = self.size, "scratchpad within window");
            return Ok(());
        }

        let mut evict = unpinned - self.size;
        let kept = items
            .into_iter()
            .filter(|item| {
                if item.is_pinned() || evict == 0 {
                    return true;
                }
                evict -= 1;
                false
            })
            .collect();
        ctx.set_scratchpad(kept)?;
        Ok(())
    }
}
