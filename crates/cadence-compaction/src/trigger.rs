//! Compaction triggers.
//!
//! Counters only rise, so [`CounterTrigger`] fires on growth since the last
//! successful compaction rather than on an absolute value. Gauges fall after a
//! compaction on their own, so [`GaugeTrigger`] compares the current value.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_engine::{CompactionTrigger, ExecutionContext};
use cadence_protocol::KeyMatch;
use cadence_protocol::keys::prefix_matches;
use parking_lot::Mutex;
use tracing::debug;

/// Fires once a counter grew by at least `delta` since the last compaction.
///
/// A zero `delta` is raised to one, so the trigger always needs growth.
#[derive(Debug)]
pub struct CounterTrigger {
    mode: KeyMatch,
    key: String,
    delta: u64,
    /// Counter values recorded at the last successful compaction.
    snapshots: Mutex<HashMap<String, i64>>,
}

impl CounterTrigger {
    pub fn exact(key: impl Into<String>, delta: u64) -> Self {
        Self::with_mode(KeyMatch::Exact, key.into(), delta)
    }

    /// Fires on the first counter under `prefix` that grew by `delta`.
    pub fn prefix(prefix: impl Into<String>, delta: u64) -> Self {
        Self::with_mode(KeyMatch::Prefix, prefix.into(), delta)
    }

    fn with_mode(mode: KeyMatch, key: String, delta: u64) -> Self {
        Self {
            mode,
            key,
            delta: delta.max(1),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn tracked(&self, ctx: &ExecutionContext) -> Vec<(String, i64)> {
        match self.mode {
            KeyMatch::Exact => {
                vec![(self.key.clone(), ctx.stats().get_counter(&self.key))]
            }
            KeyMatch::Prefix => ctx
                .stats()
                .counters()
                .into_iter()
                .filter(|(key, _)| prefix_matches(&self.key, key))
                .collect(),
        }
    }
}

impl CompactionTrigger for CounterTrigger {
    fn should_compact(&self, ctx: &ExecutionContext) -> bool {
        let snapshots = self.snapshots.lock();
        let fired = self.tracked(ctx).into_iter().find(|(key, current)| {
            let baseline = snapshots.get(key).copied().unwrap_or(0);
            u64::try_from(current.saturating_sub(baseline)).is_ok_and(|grown| grown >= self.delta)
        });
        match fired {
            Some((key, current)) => {
                debug!(key = %key, current, delta = self.delta, "counter trigger fired");
                true
            }
            None => false,
        }
    }

    /// Refreshes the snapshot of every tracked counter, not only the one
    /// that fired.
    fn notify_compacted(&self, ctx: &ExecutionContext) {
        let tracked = self.tracked(ctx);
        let mut snapshots = self.snapshots.lock();
        snapshots.extend(tracked);
    }
}

/// Fires while a gauge is at or above `threshold`.
#[derive(Debug, Clone)]
pub struct GaugeTrigger {
    mode: KeyMatch,
    key: String,
    threshold: f64,
}

impl GaugeTrigger {
    pub fn exact(key: impl Into<String>, threshold: f64) -> Self {
        Self {
            mode: KeyMatch::Exact,
            key: key.into(),
            threshold,
        }
    }

    pub fn prefix(prefix: impl Into<String>, threshold: f64) -> Self {
        Self {
            mode: KeyMatch::Prefix,
            key: prefix.into(),
            threshold,
        }
    }
}

impl CompactionTrigger for GaugeTrigger {
    fn should_compact(&self, ctx: &ExecutionContext) -> bool {
        let fired = match self.mode {
            KeyMatch::Exact => {
                let value = ctx.stats().get_gauge(&self.key);
                (value >= self.threshold).then(|| (self.key.clone(), value))
            }
            KeyMatch::Prefix => ctx
                .stats()
                .gauges()
                .into_iter()
                .find(|(key, value)| prefix_matches(&self.key, key) && *value >= self.threshold),
        };
        if let Some((key, value)) = &fired {
            debug!(key = %key, value, threshold = self.threshold, "gauge trigger fired");
        }
        fired.is_some()
    }

    fn notify_compacted(&self, _ctx: &ExecutionContext) {}
}

/// Fires when any member fires; every member is notified after a
/// compaction.
#[derive(Default)]
pub struct AnyTrigger {
    triggers: Vec<Arc<dyn CompactionTrigger>>,
}

impl AnyTrigger {
    pub fn new(triggers: Vec<Arc<dyn CompactionTrigger>>) -> Self {
        Self { triggers }
    }

    pub fn with(mut self, trigger: Arc<dyn CompactionTrigger>) -> Self {
        self.triggers.push(trigger);
        self
    }
}

impl CompactionTrigger for AnyTrigger {
    fn should_compact(&self, ctx: &ExecutionContext) -> bool {
        self.triggers
            .iter()
            .any(|trigger| trigger.should_compact(ctx))
    }

    fn notify_compacted(&self, ctx: &ExecutionContext) {
        for trigger in &self.triggers {
            trigger.notify_compacted(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cadence_engine::{Executor, InMemoryData, LoopBody, Step};
    use cadence_protocol::{EventType, TerminalReason};
    use serde_json::Value;

    use super::*;
    use crate::window::SlidingWindow;

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::root("agent", Arc::new(InMemoryData::new()))
    }

    #[test]
    fn counter_trigger_tracks_growth_since_last_compaction() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = CounterTrigger::exact("llm.tokens.total", 10);

        ctx.stats().incr_counter("llm.tokens.total", 12)?;
        assert!(trigger.should_compact(&ctx));
        trigger.notify_compacted(&ctx);

        ctx.stats().incr_counter("llm.tokens.total", 8)?;
        assert!(!trigger.should_compact(&ctx));

        ctx.stats().incr_counter("llm.tokens.total", 2)?;
        assert!(trigger.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn zero_delta_still_waits_for_growth() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = CounterTrigger::exact("llm.calls", 0);
        assert!(!trigger.should_compact(&ctx));

        ctx.stats().incr_counter("llm.calls", 1)?;
        assert!(trigger.should_compact(&ctx));
        trigger.notify_compacted(&ctx);
        assert!(!trigger.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn notify_refreshes_every_tracked_counter() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = CounterTrigger::prefix("tool.", 5);

        ctx.stats().incr_counter("tool.search", 6)?;
        ctx.stats().incr_counter("tool.fetch", 4)?;
        assert!(trigger.should_compact(&ctx));
        trigger.notify_compacted(&ctx);

        // The fetch counter must not fire on growth that predates the
        // compaction.
        ctx.stats().incr_counter("tool.fetch", 1)?;
        assert!(!trigger.should_compact(&ctx));

        ctx.stats().incr_counter("tool.fetch", 4)?;
        assert!(trigger.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn counter_prefix_ignores_local_twins() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = CounterTrigger::prefix("self:", 1);
        let plain = CounterTrigger::prefix("se", 1);

        ctx.stats().incr_counter("tokens", 50)?;
        assert!(trigger.should_compact(&ctx));
        // "self:tokens" starts with "se" but belongs to the local namespace.
        assert!(!plain.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn gauge_trigger_uses_inclusive_threshold() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = GaugeTrigger::exact("context.tokens", 4000.0);

        ctx.stats().set_gauge("context.tokens", 3999.0)?;
        assert!(!trigger.should_compact(&ctx));
        ctx.stats().set_gauge("context.tokens", 4000.0)?;
        assert!(trigger.should_compact(&ctx));
        trigger.notify_compacted(&ctx);
        assert!(trigger.should_compact(&ctx));

        ctx.stats().set_gauge("context.tokens", 1200.0)?;
        assert!(!trigger.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn gauge_prefix_fires_on_any_matching_gauge() -> anyhow::Result<()> {
        let ctx = ctx();
        let trigger = GaugeTrigger::prefix("scratchpad.", 20.0);
        ctx.stats().set_gauge("scratchpad.length", 25.0)?;
        assert!(trigger.should_compact(&ctx));
        Ok(())
    }

    #[test]
    fn any_trigger_notifies_all_members() -> anyhow::Result<()> {
        let ctx = ctx();
        let tokens = Arc::new(CounterTrigger::exact("llm.tokens.total", 100));
        let turns = Arc::new(CounterTrigger::exact("llm.calls", 3));
        let any = AnyTrigger::default()
            .with(tokens.clone())
            .with(turns.clone());

        ctx.stats().incr_counter("llm.calls", 3)?;
        ctx.stats().incr_counter("llm.tokens.total", 90)?;
        assert!(any.should_compact(&ctx));
        any.notify_compacted(&ctx);

        ctx.stats().incr_counter("llm.tokens.total", 20)?;
        assert!(!tokens.should_compact(&ctx));
        assert!(!any.should_compact(&ctx));
        Ok(())
    }

    /// Reports a per-iteration token gauge: 900 on the first pass, 100 after.
    struct TokenBurst;

    #[async_trait]
    impl LoopBody for TokenBurst {
        async fn iterate(&self, ctx: &Arc<ExecutionContext>) -> anyhow::Result<Step> {
            let tokens = if ctx.iteration() == 1 { 900.0 } else { 100.0 };
            ctx.stats().set_gauge("iteration.tokens", tokens)?;
            if ctx.iteration() == 3 {
                return Ok(Step::finish(Value::Null));
            }
            Ok(Step::next())
        }
    }

    #[tokio::test]
    async fn gauge_trigger_sees_previous_iteration_gauges() -> anyhow::Result<()> {
        let ctx = ctx();
        ctx.set_compaction(
            Arc::new(GaugeTrigger::exact("iteration.tokens", 500.0)),
            Arc::new(SlidingWindow::new(8)),
        )?;

        let record = Executor::default().execute(&ctx, &TokenBurst).await?;
        assert_eq!(record.reason, TerminalReason::Success);

        // Only the check before iteration 2 sees the 900-token burst.
        let compactions = ctx.events_of_type(EventType::Compaction);
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0].iteration, 1);
        assert_eq!(ctx.stats().get_counter("compactions"), 1);
        Ok(())
    }
}
