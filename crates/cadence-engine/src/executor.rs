//! The loop driver.
//!
//! Each pass checks cancellation, runs compaction if the trigger fires, then
//! advances the iteration counter and invokes the loop body once between a
//! before/after event pair. Limits are evaluated after the body. Whatever the
//! exit path, exactly one terminal record is kept and exactly one
//! `AfterExecution` event is published, even if the `execute` future is
//! dropped mid-run.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cadence_events::HookError;
use cadence_protocol::keys;
use cadence_protocol::{CadenceResult, EventKind, EventType, Limit, TerminalReason};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::context::{CompactionConfig, ExecutionContext, ExecutionError, TerminalRecord};

/// What the loop body wants after one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue { action: Option<String> },
    Finish { result: Value },
}

impl Step {
    pub fn next() -> Self {
        Self::Continue { action: None }
    }

    pub fn action(action: impl Into<String>) -> Self {
        Self::Continue {
            action: Some(action.into()),
        }
    }

    pub fn finish(result: Value) -> Self {
        Self::Finish { result }
    }
}

/// One iteration of the agent's work. Invoked exactly once per iteration.
#[async_trait]
pub trait LoopBody: Send + Sync {
    async fn iterate(&self, ctx: &Arc<ExecutionContext>) -> anyhow::Result<Step>;
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
    limits: Vec<Limit>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let limits = config.effective_limits();
        Self { config, limits }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `body` on `ctx` until it finishes, fails or is stopped.
    ///
    /// Returns `Err` only when the context was already started or
    /// finalized; every run that starts yields exactly one terminal record.
    #[instrument(
        skip(self, ctx, body),
        fields(context = %ctx.id(), name = %ctx.name(), depth = ctx.depth())
    )]
    pub async fn execute(
        &self,
        ctx: &Arc<ExecutionContext>,
        body: &dyn LoopBody,
    ) -> CadenceResult<TerminalRecord> {
        ctx.begin()?;
        let guard = FinalizeGuard { ctx: ctx.clone() };
        let outcome = self.drive(ctx, body).await;
        drop(guard);
        Ok(ctx.terminal().unwrap_or(outcome))
    }

    async fn drive(&self, ctx: &Arc<ExecutionContext>, body: &dyn LoopBody) -> TerminalRecord {
        let started = EventKind::BeforeExecution {
            name: ctx.name().to_owned(),
        };
        if let Err(error) = ctx.publish(started) {
            return conclude(ctx, hook_abort(EventType::BeforeExecution, error, 0));
        }

        loop {
            if ctx.is_cancelled() {
                info!(iteration = ctx.iteration(), "execution cancelled");
                return conclude(ctx, TerminalRecord::cancelled(ctx.iteration()));
            }

            if ctx.iteration() == 0 && self.config.max_iterations == Some(0) {
                let budget = Limit::exact(keys::self_key(keys::ITERATIONS), 0.0);
                info!(limit = %budget, "iteration budget is zero");
                return conclude(ctx, TerminalRecord::limit_exceeded(budget, 0));
            }

            if ctx.iteration() > 0 {
                if let Some(compaction) = ctx.compaction() {
                    if let Some(record) = self.compact(ctx, &compaction).await {
                        return conclude(ctx, record);
                    }
                }
            }

            let iteration = ctx.advance_iteration();
            if let Err(error) = ctx.publish(EventKind::BeforeIteration) {
                return conclude(ctx, hook_abort(EventType::BeforeIteration, error, iteration));
            }

            let started = Instant::now();
            let outcome = body.iterate(ctx).await;
            let duration_ms = elapsed_ms(started);

            let (action, result, failure) = match &outcome {
                Ok(Step::Continue { action }) => (action.clone(), None, None),
                Ok(Step::Finish { result }) => (None, Some(result.clone()), None),
                Err(error) => (None, None, Some(format!("{error:#}"))),
            };
            let after = ctx.publish(EventKind::AfterIteration {
                action,
                finished: result.is_some(),
                result,
                duration_ms,
                error: failure,
            });

            let step = match outcome {
                Ok(step) => step,
                Err(error) => {
                    if let Err(hook_error) = after {
                        warn!(iteration, error = %hook_error, "after-iteration hook failed after a body error");
                    }
                    warn!(iteration, error = %format!("{error:#}"), "loop body failed");
                    let record = TerminalRecord::failure(
                        TerminalReason::Error,
                        ExecutionError::Iteration { iteration, error },
                        iteration,
                    );
                    return conclude(ctx, record);
                }
            };
            if let Err(error) = after {
                return conclude(ctx, hook_abort(EventType::AfterIteration, error, iteration));
            }

            if let Step::Finish { result } = step {
                return conclude(ctx, TerminalRecord::success(result, iteration));
            }

            if let Some(limit) = ctx.stats().check_limits(&self.limits) {
                info!(iteration, limit = %limit, "limit exceeded");
                return conclude(ctx, TerminalRecord::limit_exceeded(limit, iteration));
            }
        }
    }

    /// Returns the terminal record when compaction ended the run.
    async fn compact(
        &self,
        ctx: &ExecutionContext,
        compaction: &CompactionConfig,
    ) -> Option<TerminalRecord> {
        if !compaction.trigger.should_compact(ctx) {
            return None;
        }
        let strategy = compaction.strategy.name().to_owned();
        let iterations = ctx.iteration();
        let before_len = ctx.scratchpad_len();
        let started = Instant::now();

        if let Err(error) = compaction.strategy.compact(ctx).await {
            warn!(strategy = %strategy, error = %format!("{error:#}"), "compaction failed");
            return Some(TerminalRecord::failure(
                TerminalReason::CompactionFailed,
                ExecutionError::Compaction { strategy, error },
                iterations,
            ));
        }

        let after_len = ctx.scratchpad_len();
        let duration_ms = elapsed_ms(started);
        let event = EventKind::Compaction {
            strategy: strategy.clone(),
            before_len,
            after_len,
            duration_ms,
        };
        if let Err(error) = ctx.publish(event) {
            return Some(hook_abort(EventType::Compaction, error, iterations));
        }
        compaction.trigger.notify_compacted(ctx);
        info!(strategy = %strategy, before_len, after_len, duration_ms, "scratchpad compacted");
        None
    }
}

fn conclude(ctx: &ExecutionContext, record: TerminalRecord) -> TerminalRecord {
    if let Err(error) = ctx.record_terminal(record.clone()) {
        debug!(error = %error, "keeping earlier terminal record");
    }
    record
}

fn hook_abort(event: EventType, error: HookError, iterations: u64) -> TerminalRecord {
    TerminalRecord::failure(
        TerminalReason::HookAbort,
        ExecutionError::Hook { event, error },
        iterations,
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Finalizes the context when `execute` returns, unwinds or is dropped.
struct FinalizeGuard {
    ctx: Arc<ExecutionContext>,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        finalize(&self.ctx);
    }
}

fn finalize(ctx: &ExecutionContext) {
    if !ctx.mark_terminated() {
        return;
    }
    let iterations = ctx.iteration();
    let record = match ctx.terminal() {
        Some(record) => record,
        None => {
            warn!(context = %ctx.id(), iterations, "execution abandoned without a terminal record");
            let aborted =
                TerminalRecord::failure(TerminalReason::Error, ExecutionError::Aborted, iterations);
            conclude(ctx, aborted)
        }
    };

    let finished = EventKind::AfterExecution {
        reason: record.reason,
        iterations: record.iterations,
        error: record.error_message(),
    };
    if let Err(error) = ctx.publish(finished) {
        warn!(context = %ctx.id(), error = %error, "after-execution hook failed");
    }
    ctx.close_stream();
    info!(
        context = %ctx.id(),
        reason = %record.reason,
        iterations = record.iterations,
        "execution finished"
    );
}
