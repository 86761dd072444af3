mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_kernel::compaction::{CounterTrigger, SlidingWindow};
use cadence_kernel::engine::{
    CompactionStrategy, CompactionTrigger, ExecutionContext, GenerativePort, InMemoryData,
    LoopBody, Step, TerminalRecord,
};
use cadence_kernel::protocol::{
    Generation, GenerationRequest, Iteration, Message, Role, TokenUsage, keys,
};
use cadence_kernel::{CadenceKernel, ChildRun};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cadenced")]
#[command(about = "Cadence agent-loop demo")]
struct Cli {
    #[arg(long, default_value = "cadence-demo")]
    name: String,
    /// Turns the scripted agent takes before finishing.
    #[arg(long, default_value_t = 8)]
    turns: u64,
    #[arg(long, default_value_t = 20)]
    max_iterations: u64,
    /// Unpinned scratchpad items kept by the sliding window.
    #[arg(long, default_value_t = 4)]
    window: usize,
    /// Compact after every N iterations of the same context.
    #[arg(long, default_value_t = 3)]
    compact_every: u64,
    /// Parallel workers spawned on the first turn.
    #[arg(long, default_value_t = 0)]
    children: usize,
    #[arg(long)]
    json_logs: bool,
}

/// Deterministic generator that answers with the last prompt line.
struct EchoGenerator;

#[async_trait]
impl GenerativePort for EchoGenerator {
    async fn generate(
        &self,
        _ctx: &ExecutionContext,
        request: GenerationRequest,
    ) -> Result<Generation> {
        let prompt_tokens = request
            .messages
            .iter()
            .map(|message| message.text_content().split_whitespace().count())
            .sum::<usize>();
        let last = request
            .messages
            .last()
            .map(Message::text_content)
            .unwrap_or_default();
        let content = format!("ack: {last}");
        let completion_tokens = content.split_whitespace().count();
        Ok(Generation {
            content,
            usage: TokenUsage::new(
                u32::try_from(prompt_tokens).unwrap_or(u32::MAX),
                u32::try_from(completion_tokens).unwrap_or(u32::MAX),
            ),
        })
    }
}

/// One scripted turn: prompt the generator with the scratchpad plus a new
/// user message and append both sides of the exchange.
async fn take_turn(
    ctx: &ExecutionContext,
    generator: &dyn GenerativePort,
    prompt: String,
) -> Result<()> {
    let mut messages: Vec<Message> = ctx
        .scratchpad()
        .into_iter()
        .flat_map(|item| item.messages)
        .collect();
    messages.push(Message::text(Role::User, prompt.clone()));

    let request = GenerationRequest {
        stream_id: "main".to_owned(),
        purpose: "turn".to_owned(),
        messages,
    };
    let generation = ctx.generate(generator, request).await?;
    let turn = ctx.iteration();
    ctx.push_iteration(Iteration::text(Role::User, prompt).with_turn(turn))?;
    ctx.push_iteration(Iteration::text(Role::Assistant, generation.content).with_turn(turn))?;
    Ok(())
}

struct Worker {
    generator: Arc<dyn GenerativePort>,
    turns: u64,
}

#[async_trait]
impl LoopBody for Worker {
    async fn iterate(&self, ctx: &Arc<ExecutionContext>) -> Result<Step> {
        let prompt = format!("{} step {}", ctx.name(), ctx.iteration());
        take_turn(ctx, self.generator.as_ref(), prompt).await?;
        if ctx.iteration() >= self.turns {
            return Ok(Step::finish(json!({ "worker": ctx.name() })));
        }
        Ok(Step::action("work"))
    }
}

struct ScriptedAgent {
    kernel: CadenceKernel,
    generator: Arc<dyn GenerativePort>,
    turns: u64,
    children: usize,
}

#[async_trait]
impl LoopBody for ScriptedAgent {
    async fn iterate(&self, ctx: &Arc<ExecutionContext>) -> Result<Step> {
        let iteration = ctx.iteration();
        if iteration == 1 {
            ctx.push_iteration(
                Iteration::text(Role::System, "You are a careful planning agent.")
                    .with_importance(1.0),
            )?;
            if self.children > 0 {
                self.fan_out(ctx).await?;
            }
        }

        take_turn(ctx, self.generator.as_ref(), format!("plan step {iteration}")).await?;
        if iteration >= self.turns {
            return Ok(Step::finish(json!({ "turns": iteration })));
        }
        Ok(Step::action("plan"))
    }
}

impl ScriptedAgent {
    async fn fan_out(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        let worker: Arc<dyn LoopBody> = Arc::new(Worker {
            generator: self.generator.clone(),
            turns: 2,
        });
        let runs = (0..self.children)
            .map(|index| {
                ChildRun::new(
                    format!("worker-{index}"),
                    Arc::new(InMemoryData::new()),
                    worker.clone(),
                )
            })
            .collect();
        for (child, record) in self.kernel.run_parallel(ctx, runs).await? {
            info!(
                child = child.name(),
                reason = %record.reason,
                iterations = record.iterations,
                llm_calls = child.stats().get_counter(keys::LLM_CALLS),
                "worker finished"
            );
        }
        Ok(())
    }
}

fn report(ctx: &ExecutionContext, record: &TerminalRecord) -> Result<()> {
    let summary = json!({
        "context": ctx.id(),
        "reason": record.reason,
        "iterations": record.iterations,
        "error": record.error_message(),
        "exceeded": record.exceeded,
        "result": record.result,
        "scratchpad_length": ctx.scratchpad_len(),
        "stats": ctx.stats().snapshot(),
    });
    let rendered = serde_json::to_string_pretty(&summary).context("failed to render report")?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json_logs);

    let window = cli.window;
    let compact_every = cli.compact_every;
    let kernel = CadenceKernel::builder()
        .max_iterations(cli.max_iterations)
        .compaction(move || {
            let trigger: Arc<dyn CompactionTrigger> =
                Arc::new(CounterTrigger::exact(keys::self_key(keys::ITERATIONS), compact_every));
            let strategy: Arc<dyn CompactionStrategy> = Arc::new(SlidingWindow::new(window));
            (trigger, strategy)
        })
        .build();

    let root = kernel.root_context(cli.name.clone(), Arc::new(InMemoryData::new()))?;
    let mut events = root.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let rendered = serde_json::to_string(&event.kind).unwrap_or_else(|_| "{}".to_owned());
            info!(
                sequence = event.sequence,
                iteration = event.iteration,
                event = %rendered,
                "event.published"
            );
        }
    });

    let agent = ScriptedAgent {
        kernel: kernel.clone(),
        generator: Arc::new(EchoGenerator),
        turns: cli.turns,
        children: cli.children,
    };
    let record = kernel.execute(&root, &agent).await?;
    if let Err(error) = event_task.await {
        warn!(error = %error, "event task failed");
    }

    info!(
        reason = %record.reason,
        iterations = record.iterations,
        compactions = root.stats().get_counter(keys::COMPACTIONS),
        "run complete"
    );
    report(&root, &record)
}
