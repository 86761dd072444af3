//! Kernel facade over the Cadence runtime.
//!
//! [`KernelBuilder`] collects limits, hooks and a compaction setup once;
//! [`CadenceKernel`] then creates contexts with that setup applied and runs
//! loop bodies on them, sequentially or as parallel children of a parent.

use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_engine::{
    CompactionStrategy, CompactionTrigger, DataStore, ExecutionContext, Executor, ExecutorConfig,
    LoopBody, TerminalRecord,
};
use cadence_events::Hook;
use cadence_protocol::{EventType, Limit};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub use cadence_compaction as compaction;
pub use cadence_engine as engine;
pub use cadence_events as events;
pub use cadence_protocol as protocol;

/// Builds a fresh trigger and strategy for every context the kernel starts.
/// Triggers hold snapshot state, so contexts never share one.
pub type CompactionFactory =
    Arc<dyn Fn() -> (Arc<dyn CompactionTrigger>, Arc<dyn CompactionStrategy>) + Send + Sync>;

#[derive(Clone)]
enum HookTarget {
    One(EventType),
    All,
}

#[derive(Clone, Default)]
pub struct KernelBuilder {
    config: ExecutorConfig,
    hooks: Vec<(HookTarget, Arc<dyn Hook>)>,
    compaction: Option<CompactionFactory>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.config.limits.push(limit);
        self
    }

    pub fn limits(mut self, limits: impl IntoIterator<Item = Limit>) -> Self {
        self.config.limits.extend(limits);
        self
    }

    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.config.max_iterations = Some(max_iterations);
        self
    }

    pub fn hook(mut self, event_type: EventType, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push((HookTarget::One(event_type), hook));
        self
    }

    pub fn hook_all(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push((HookTarget::All, hook));
        self
    }

    pub fn compaction<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> (Arc<dyn CompactionTrigger>, Arc<dyn CompactionStrategy>)
            + Send
            + Sync
            + 'static,
    {
        self.compaction = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> CadenceKernel {
        CadenceKernel {
            executor: Executor::new(self.config),
            hooks: self.hooks.into(),
            compaction: self.compaction,
        }
    }
}

/// One child execution for [`CadenceKernel::run_parallel`].
pub struct ChildRun {
    pub name: String,
    pub data: Arc<dyn DataStore>,
    pub body: Arc<dyn LoopBody>,
}

impl ChildRun {
    pub fn new(name: impl Into<String>, data: Arc<dyn DataStore>, body: Arc<dyn LoopBody>) -> Self {
        Self {
            name: name.into(),
            data,
            body,
        }
    }
}

#[derive(Clone)]
pub struct CadenceKernel {
    executor: Executor,
    hooks: Arc<[(HookTarget, Arc<dyn Hook>)]>,
    compaction: Option<CompactionFactory>,
}

impl CadenceKernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Root context with the kernel's hooks and compaction applied.
    pub fn root_context(
        &self,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
    ) -> Result<Arc<ExecutionContext>> {
        let ctx = ExecutionContext::root(name, data);
        self.prepare_root(&ctx)?;
        Ok(ctx)
    }

    /// Root context cancelled through `cancellation`.
    pub fn root_context_with_cancellation(
        &self,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
        cancellation: CancellationToken,
    ) -> Result<Arc<ExecutionContext>> {
        let ctx = ExecutionContext::root_with_cancellation(name, data, cancellation);
        self.prepare_root(&ctx)?;
        Ok(ctx)
    }

    /// Child of `parent` with the kernel's compaction applied. Hooks are
    /// inherited from the parent.
    pub fn child_context(
        &self,
        parent: &Arc<ExecutionContext>,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
    ) -> Result<Arc<ExecutionContext>> {
        let child = parent
            .spawn_child(name, data)
            .with_context(|| format!("failed to spawn child of context {}", parent.id()))?;
        self.apply_compaction(&child)?;
        Ok(child)
    }

    fn prepare_root(&self, ctx: &ExecutionContext) -> Result<()> {
        for (target, hook) in self.hooks.iter() {
            match target {
                HookTarget::One(event_type) => ctx.hooks().register(*event_type, hook.clone()),
                HookTarget::All => ctx.hooks().register_all(hook.clone()),
            }
        }
        self.apply_compaction(ctx)
    }

    fn apply_compaction(&self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(factory) = &self.compaction {
            let (trigger, strategy) = factory();
            ctx.set_compaction(trigger, strategy).with_context(|| {
                format!("failed to configure compaction for context {}", ctx.id())
            })?;
        }
        Ok(())
    }

    /// Execute `body` on an already prepared context.
    pub async fn execute(
        &self,
        ctx: &Arc<ExecutionContext>,
        body: &dyn LoopBody,
    ) -> Result<TerminalRecord> {
        self.executor
            .execute(ctx, body)
            .await
            .with_context(|| format!("failed to execute context {}", ctx.id()))
    }

    /// Create a root context and run `body` on it to completion.
    #[instrument(skip(self, name, data, body))]
    pub async fn run(
        &self,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
        body: &dyn LoopBody,
    ) -> Result<(Arc<ExecutionContext>, TerminalRecord)> {
        let ctx = self.root_context(name, data)?;
        let record = self.execute(&ctx, body).await?;
        Ok((ctx, record))
    }

    /// Spawn a child of `parent` and run `body` on it on the current task.
    #[instrument(skip(self, parent, name, data, body), fields(parent = %parent.id()))]
    pub async fn run_child(
        &self,
        parent: &Arc<ExecutionContext>,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
        body: &dyn LoopBody,
    ) -> Result<(Arc<ExecutionContext>, TerminalRecord)> {
        let child = self.child_context(parent, name, data)?;
        let record = self.execute(&child, body).await?;
        Ok((child, record))
    }

    /// Run every child on its own task and wait for all of them. Results are
    /// returned in input order.
    #[instrument(
        skip(self, parent, children),
        fields(parent = %parent.id(), children = children.len())
    )]
    pub async fn run_parallel(
        &self,
        parent: &Arc<ExecutionContext>,
        children: Vec<ChildRun>,
    ) -> Result<Vec<(Arc<ExecutionContext>, TerminalRecord)>> {
        let mut tasks = Vec::with_capacity(children.len());
        for ChildRun { name, data, body } in children {
            let child = self.child_context(parent, name, data)?;
            let executor = self.executor.clone();
            tasks.push(tokio::spawn(async move {
                let record = executor.execute(&child, body.as_ref()).await;
                (child, record)
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            let (child, record) = joined.context("child execution task failed")?;
            let record =
                record.with_context(|| format!("failed to execute context {}", child.id()))?;
            results.push((child, record));
        }
        info!(completed = results.len(), "parallel children finished");
        Ok(results)
    }
}
