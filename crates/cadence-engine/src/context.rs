//! The execution-context tree.
//!
//! A context is passed explicitly to every collaborator. It owns its stats
//! node, its event log and the list of children spawned from it; the
//! scratchpad lives in the caller-supplied [`DataStore`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use cadence_events::{EventLog, EventStreamHub, HookError, HookRegistry};
use cadence_protocol::keys;
use cadence_protocol::{
    CadenceError, CadenceResult, ContextId, EventEnvelope, EventKind, EventType, ExecutionState,
    Generation, GenerationRequest, Iteration, Limit, TerminalReason, TokenUsage,
};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compaction::{CompactionStrategy, CompactionTrigger};
use crate::data::DataStore;
use crate::generative::GenerativePort;
use crate::stats::Stats;

/// Error carried in a terminal record.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("iteration {iteration} failed: {error:#}")]
    Iteration {
        iteration: u64,
        error: anyhow::Error,
    },
    #[error("compaction strategy {strategy} failed: {error:#}")]
    Compaction {
        strategy: String,
        error: anyhow::Error,
    },
    #[error("{event} hook failed: {error}")]
    Hook { event: EventType, error: HookError },
    #[error("execution abandoned before it completed")]
    Aborted,
}

/// The single definitive outcome of one execution.
#[derive(Debug, Clone)]
pub struct TerminalRecord {
    pub reason: TerminalReason,
    pub error: Option<Arc<ExecutionError>>,
    pub exceeded: Option<Limit>,
    pub result: Option<Value>,
    /// Iterations this node completed or entered.
    pub iterations: u64,
}

impl TerminalRecord {
    pub fn success(result: Value, iterations: u64) -> Self {
        Self {
            reason: TerminalReason::Success,
            error: None,
            exceeded: None,
            result: Some(result),
            iterations,
        }
    }

    pub fn failure(reason: TerminalReason, error: ExecutionError, iterations: u64) -> Self {
        Self {
            reason,
            error: Some(Arc::new(error)),
            exceeded: None,
            result: None,
            iterations,
        }
    }

    /// Cancellation is a reason, not an error.
    pub fn cancelled(iterations: u64) -> Self {
        Self {
            reason: TerminalReason::ContextCancelled,
            error: None,
            exceeded: None,
            result: None,
            iterations,
        }
    }

    pub fn limit_exceeded(limit: Limit, iterations: u64) -> Self {
        Self {
            reason: TerminalReason::LimitExceeded,
            error: None,
            exceeded: Some(limit),
            result: None,
            iterations,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|error| error.to_string())
    }
}

/// Trigger and strategy configured together, once.
#[derive(Clone)]
pub struct CompactionConfig {
    pub trigger: Arc<dyn CompactionTrigger>,
    pub strategy: Arc<dyn CompactionStrategy>,
}

impl fmt::Debug for CompactionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionConfig")
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ContextState {
    iteration: u64,
    execution: ExecutionState,
    children: Vec<Arc<ExecutionContext>>,
    compaction: Option<CompactionConfig>,
    terminal: Option<TerminalRecord>,
}

pub struct ExecutionContext {
    id: ContextId,
    name: String,
    depth: u32,
    parent: Option<Weak<ExecutionContext>>,
    stats: Arc<Stats>,
    events: EventLog,
    hooks: Arc<HookRegistry>,
    stream: EventStreamHub,
    cancellation: CancellationToken,
    data: Arc<dyn DataStore>,
    state: RwLock<ContextState>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("iteration", &state.iteration)
            .field("execution", &state.execution)
            .field("children", &state.children.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn root(name: impl Into<String>, data: Arc<dyn DataStore>) -> Arc<Self> {
        Self::root_with_cancellation(name, data, CancellationToken::new())
    }

    /// Root whose cancellation is driven by an externally owned token.
    pub fn root_with_cancellation(
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::default(),
            name: name.into(),
            depth: 0,
            parent: None,
            stats: Stats::root(),
            events: EventLog::new(),
            hooks: Arc::new(HookRegistry::new()),
            stream: EventStreamHub::default(),
            cancellation,
            data,
            state: RwLock::new(ContextState::default()),
        })
    }

    /// New child one level deeper. Its stats feed this node's stats, it
    /// shares this node's hooks, and it observes this node's cancellation
    /// without being able to cancel it.
    pub fn spawn_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
    ) -> CadenceResult<Arc<Self>> {
        let mut state = self.state.write();
        if state.execution == ExecutionState::Terminated {
            return Err(CadenceError::ContextFinalized(self.id.to_string()));
        }
        let child = Arc::new(Self {
            id: ContextId::default(),
            name: name.into(),
            depth: self.depth + 1,
            parent: Some(Arc::downgrade(self)),
            stats: Stats::child(self.stats.clone()),
            events: EventLog::new(),
            hooks: self.hooks.clone(),
            stream: EventStreamHub::default(),
            cancellation: self.cancellation.child_token(),
            data,
            state: RwLock::new(ContextState::default()),
        });
        state.children.push(child.clone());
        debug!(parent = %self.id, child = %child.id, depth = child.depth, "child context spawned");
        Ok(child)
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent(&self) -> Option<Arc<ExecutionContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<ExecutionContext>> {
        self.state.read().children.clone()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn data(&self) -> &Arc<dyn DataStore> {
        &self.data
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn iteration(&self) -> u64 {
        self.state.read().iteration
    }

    pub fn state(&self) -> ExecutionState {
        self.state.read().execution
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.snapshot()
    }

    pub fn events_of_type(&self, event_type: EventType) -> Vec<EventEnvelope> {
        self.events.of_type(event_type)
    }

    pub fn event_count(&self, event_type: EventType) -> usize {
        self.events.count(event_type)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.stream.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<EventEnvelope> {
        self.stream.subscribe_stream()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once this context or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Append an event to this node's log and run its hooks inline.
    ///
    /// Built-in stat effects of the event are applied first, then the event
    /// is appended and fanned out to subscribers, and only then are hooks
    /// invoked. The first hook failure is returned.
    pub fn publish(&self, kind: EventKind) -> Result<EventEnvelope, HookError> {
        match &kind {
            EventKind::BeforeIteration => {
                self.stats
                    .reset_gauges_with_prefix(keys::ITERATION_GAUGE_PREFIX);
            }
            EventKind::AfterIteration { duration_ms, .. } => {
                self.stats
                    .put_gauge(keys::ITERATION_DURATION_MS, *duration_ms as f64);
            }
            EventKind::Compaction { .. } => self.stats.record(keys::COMPACTIONS, 1),
            _ => {}
        }

        let envelope = EventEnvelope::new(self.id.clone(), self.iteration(), self.depth, kind);
        let envelope = self.events.append(envelope);
        self.stream.publish(envelope.clone());
        debug!(
            context = %self.id,
            sequence = envelope.sequence,
            iteration = envelope.iteration,
            event_type = %envelope.event_type(),
            "event published"
        );
        self.hooks.dispatch(&envelope)?;
        Ok(envelope)
    }

    pub fn scratchpad(&self) -> Vec<Iteration> {
        self.data.scratchpad()
    }

    pub fn scratchpad_len(&self) -> usize {
        self.data.scratchpad().len()
    }

    /// Replace the scratchpad.
    ///
    /// Owns the observability of the swap: updates the length gauge and
    /// publishes one `ScratchpadReplaced` event with the diff counts.
    pub fn set_scratchpad(&self, items: Vec<Iteration>) -> Result<(), HookError> {
        let previous = self.data.scratchpad();
        let (removed, added) = scratchpad_diff(&previous, &items);
        self.replace_scratchpad(previous.len(), items, removed, added)
    }

    /// Append one turn to the scratchpad.
    pub fn push_iteration(&self, item: Iteration) -> Result<(), HookError> {
        let mut items = self.data.scratchpad();
        let before_len = items.len();
        items.push(item);
        self.replace_scratchpad(before_len, items, 0, 1)
    }

    fn replace_scratchpad(
        &self,
        before_len: usize,
        items: Vec<Iteration>,
        removed: usize,
        added: usize,
    ) -> Result<(), HookError> {
        let after_len = items.len();
        self.data.replace_scratchpad(items);

        self.stats
            .put_gauge(keys::SCRATCHPAD_LENGTH, after_len as f64);
        self.publish(EventKind::ScratchpadReplaced {
            before_len,
            after_len,
            removed,
            added,
        })?;
        Ok(())
    }

    /// Configure compaction for this context. Allowed once.
    pub fn set_compaction(
        &self,
        trigger: Arc<dyn CompactionTrigger>,
        strategy: Arc<dyn CompactionStrategy>,
    ) -> CadenceResult<()> {
        let mut state = self.state.write();
        if state.compaction.is_some() {
            return Err(CadenceError::CompactionAlreadyConfigured);
        }
        state.compaction = Some(CompactionConfig { trigger, strategy });
        Ok(())
    }

    pub fn compaction(&self) -> Option<CompactionConfig> {
        self.state.read().compaction.clone()
    }

    /// Record the outcome of this execution. The first record wins; any
    /// later attempt is rejected and leaves it unchanged.
    pub fn record_terminal(&self, record: TerminalRecord) -> CadenceResult<()> {
        let mut state = self.state.write();
        if let Some(existing) = &state.terminal {
            warn!(
                context = %self.id,
                recorded = %existing.reason,
                rejected = %record.reason,
                "terminal record already set"
            );
            return Err(CadenceError::TerminalAlreadyRecorded);
        }
        state.terminal = Some(record);
        Ok(())
    }

    pub fn terminal(&self) -> Option<TerminalRecord> {
        self.state.read().terminal.clone()
    }

    /// Call the generative capability and record its usage on this node.
    pub async fn generate(
        &self,
        port: &dyn GenerativePort,
        request: GenerationRequest,
    ) -> anyhow::Result<Generation> {
        let stream_id = request.stream_id.clone();
        let purpose = request.purpose.clone();
        let generation = port.generate(self, request).await?;
        self.record_usage(stream_id, purpose, generation.usage)?;
        Ok(generation)
    }

    /// Usage counters propagate like every counter; the token gauges stay on
    /// this node.
    pub fn record_usage(
        &self,
        stream_id: impl Into<String>,
        purpose: impl Into<String>,
        usage: TokenUsage,
    ) -> Result<(), HookError> {
        self.stats.record(keys::LLM_CALLS, 1);
        self.stats
            .record(keys::LLM_PROMPT_TOKENS, i64::from(usage.prompt_tokens));
        self.stats
            .record(keys::LLM_COMPLETION_TOKENS, i64::from(usage.completion_tokens));
        self.stats
            .record(keys::LLM_TOTAL_TOKENS, i64::from(usage.total_tokens));
        self.stats
            .add_gauge(keys::ITERATION_TOKENS, f64::from(usage.total_tokens));
        self.stats
            .put_gauge(keys::CONTEXT_TOKENS, f64::from(usage.prompt_tokens));
        self.publish(EventKind::GenerationCompleted {
            stream_id: stream_id.into(),
            purpose: purpose.into(),
            usage,
        })?;
        Ok(())
    }

    pub(crate) fn begin(&self) -> CadenceResult<()> {
        let mut state = self.state.write();
        match state.execution {
            ExecutionState::NotStarted => {
                state.execution = ExecutionState::Running;
                Ok(())
            }
            ExecutionState::Running => {
                Err(CadenceError::ExecutionAlreadyStarted(self.id.to_string()))
            }
            ExecutionState::Terminated => {
                Err(CadenceError::ContextFinalized(self.id.to_string()))
            }
        }
    }

    pub(crate) fn advance_iteration(&self) -> u64 {
        let iteration = {
            let mut state = self.state.write();
            state.iteration += 1;
            state.iteration
        };
        self.stats.advance_iteration();
        iteration
    }

    /// Returns whether this call moved the context to `Terminated`.
    pub(crate) fn mark_terminated(&self) -> bool {
        let mut state = self.state.write();
        if state.execution == ExecutionState::Terminated {
            return false;
        }
        state.execution = ExecutionState::Terminated;
        true
    }

    pub(crate) fn close_stream(&self) {
        self.stream.close();
    }
}

/// Multiset difference between two scratchpads as `(removed, added)`.
/// Items are matched by their debug rendering, so duplicates count separately.
fn scratchpad_diff(previous: &[Iteration], next: &[Iteration]) -> (usize, usize) {
    let mut unmatched: HashMap<String, usize> = HashMap::with_capacity(previous.len());
    for item in previous {
        *unmatched.entry(format!("{item:?}")).or_default() += 1;
    }
    let mut added = 0;
    for item in next {
        match unmatched.get_mut(&format!("{item:?}")) {
            Some(count) if *count > 0 => *count -= 1,
            _ => added += 1,
        }
    }
    (unmatched.values().sum(), added)
}
