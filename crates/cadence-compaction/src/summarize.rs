//! Progressive summarization of the scratchpad.
//!
//! The scratchpad is partitioned into pinned items, prior synthetic
//! summaries, a recent tail of `keep_recent` items, and everything else. The
//! text of the last group is condensed by one generative call, with any prior
//! summary folded into the prompt. The result is installed as
//! `[summary, pinned.., tail..]`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cadence_engine::{CompactionStrategy, ExecutionContext, GenerativePort};
use cadence_protocol::{
    CadenceError, CadenceResult, GenerationRequest, Iteration, Message, Origin, Role,
};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DEFAULT_PROMPT: &str = include_str!("prompts/summary.md");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// Most recent unpinned items left untouched. Zero summarizes everything.
    pub keep_recent: usize,
    pub purpose: String,
    pub stream_id: String,
    /// minijinja template rendered with `prior_summary` and `transcript`.
    pub prompt_template: String,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            keep_recent: 0,
            purpose: "compaction.summary".to_owned(),
            stream_id: "compaction".to_owned(),
            prompt_template: DEFAULT_PROMPT.to_owned(),
        }
    }
}

pub struct Summarization {
    port: Arc<dyn GenerativePort>,
    config: SummarizationConfig,
}

impl Summarization {
    /// Fails if the prompt template does not parse.
    pub fn new(port: Arc<dyn GenerativePort>, config: SummarizationConfig) -> CadenceResult<Self> {
        Environment::new()
            .template_from_str(&config.prompt_template)
            .map_err(|error| CadenceError::Template(error.to_string()))?;
        Ok(Self { port, config })
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    fn render(&self, prior_summary: Option<&str>, transcript: &str) -> anyhow::Result<String> {
        let prompt = Environment::new()
            .render_str(
                &self.config.prompt_template,
                context! {
                    prior_summary => prior_summary,
                    transcript => transcript,
                },
            )
            .context("rendering summary prompt")?;
        Ok(prompt)
    }
}

struct Partition {
    pinned: Vec<Iteration>,
    prior: Vec<Iteration>,
    condense: Vec<Iteration>,
    tail: Vec<Iteration>,
}

fn partition(items: Vec<Iteration>, keep_recent: usize) -> Partition {
    let mut pinned = Vec::new();
    let mut prior = Vec::new();
    let mut rest = Vec::new();
    for item in items {
        if item.is_pinned() {
            pinned.push(item);
        } else if item.is_summary() {
            prior.push(item);
        } else {
            rest.push(item);
        }
    }
    let tail = rest.split_off(rest.len().saturating_sub(keep_recent));
    Partition {
        pinned,
        prior,
        condense: rest,
        tail,
    }
}

fn summary_text(item: &Iteration) -> String {
    item.messages
        .iter()
        .map(Message::text_content)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl CompactionStrategy for Summarization {
    fn name(&self) -> &str {
        "summarization"
    }

    async fn compact(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let Partition {
            pinned,
            prior,
            condense,
            tail,
        } = partition(ctx.scratchpad(), self.config.keep_recent);
        if condense.is_empty() {
            debug!(tail = tail.len(), pinned = pinned.len(), "nothing to summarize");
            return Ok(());
        }

        let prior_summary = prior
            .iter()
            .map(summary_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let transcript = condense
            .iter()
            .map(Iteration::transcript)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.render(
            (!prior_summary.is_empty()).then_some(prior_summary.as_str()),
            &transcript,
        )?;

        let request = GenerationRequest {
            stream_id: self.config.stream_id.clone(),
            purpose: self.config.purpose.clone(),
            messages: vec![Message::text(Role::User, prompt)],
        };
        let generation = ctx
            .generate(self.port.as_ref(), request)
            .await
            .context("summary generation failed")?;

        let folded: usize = prior
            .iter()
            .map(|item| item.metadata.summarized_count.unwrap_or(1))
            .sum();
        let summarized = condense.len() + folded;
        let mut summary = Iteration::text(Role::Assistant, generation.content.trim())
            .with_origin(Origin::SyntheticSummary)
            .with_turn(ctx.iteration());
        summary.metadata.summarized_count = Some(summarized);

        let mut items = Vec::with_capacity(1 + pinned.len() + tail.len());
        items.push(summary);
        items.extend(pinned);
        items.extend(tail);
        ctx.set_scratchpad(items)?;

        info!(
            condensed = condense.len(),
            folded,
            summarized,
            "scratchpad summarized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cadence_engine::InMemoryData;
    use cadence_protocol::keys;
    use cadence_protocol::{EventType, Generation, TokenUsage};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingGenerator {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl GenerativePort for RecordingGenerator {
        async fn generate(
            &self,
            _ctx: &ExecutionContext,
            request: GenerationRequest,
        ) -> anyhow::Result<Generation> {
            if self.fail {
                anyhow::bail!("model overloaded");
            }
            assert_eq!(request.purpose, "compaction.summary");
            self.prompts.lock().push(request.messages[0].text_content());
            Ok(Generation {
                content: " condensed notes ".to_owned(),
                usage: TokenUsage::new(300, 40),
            })
        }
    }

    fn turn(role: Role, text: &str) -> Iteration {
        Iteration::text(role, text)
    }

    fn ctx(items: Vec<Iteration>) -> Arc<ExecutionContext> {
        ExecutionContext::root("agent", Arc::new(InMemoryData::with_scratchpad(items)))
    }

    fn strategy(
        generator: Arc<RecordingGenerator>,
        keep_recent: usize,
    ) -> CadenceResult<Summarization> {
        Summarization::new(
            generator,
            SummarizationConfig {
                keep_recent,
                ..SummarizationConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn condenses_everything_but_pinned_and_recent_tail() -> anyhow::Result<()> {
        let generator = Arc::new(RecordingGenerator::default());
        let ctx = ctx(vec![
            turn(Role::User, "find flights to Lisbon"),
            turn(Role::User, "budget is 400 EUR").with_importance(0.9),
            turn(Role::Assistant, "found three options"),
            turn(Role::Tool, "option C sold out"),
        ]);

        strategy(generator.clone(), 1)?.compact(&ctx).await?;

        let items = ctx.scratchpad();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_summary());
        assert_eq!(items[0].messages[0].text_content(), "condensed notes");
        assert_eq!(items[0].metadata.summarized_count, Some(2));
        assert_eq!(items[1].messages[0].text_content(), "budget is 400 EUR");
        assert_eq!(items[2].messages[0].text_content(), "option C sold out");

        let prompts = generator.prompts.lock();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("user: find flights to Lisbon"));
        assert!(prompts[0].contains("assistant: found three options"));
        assert!(!prompts[0].contains("budget is 400 EUR"));
        assert!(!prompts[0].contains("option C sold out"));
        assert!(!prompts[0].contains("Summary of earlier work"));

        assert_eq!(ctx.event_count(EventType::ScratchpadReplaced), 1);
        assert_eq!(ctx.event_count(EventType::GenerationCompleted), 1);
        assert_eq!(ctx.stats().get_counter(keys::LLM_TOTAL_TOKENS), 340);
        Ok(())
    }

    #[tokio::test]
    async fn prior_summary_is_folded_into_the_prompt() -> anyhow::Result<()> {
        let generator = Arc::new(RecordingGenerator::default());
        let mut prior = turn(Role::Assistant, "user wants Lisbon under 400 EUR")
            .with_origin(Origin::SyntheticSummary);
        prior.metadata.summarized_count = Some(3);
        let ctx = ctx(vec![
            prior,
            turn(Role::Assistant, "booked option A"),
            turn(Role::User, "thanks"),
        ]);

        strategy(generator.clone(), 0)?.compact(&ctx).await?;

        let items = ctx.scratchpad();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata.summarized_count, Some(5));
        let prompts = generator.prompts.lock();
        assert!(prompts[0].contains("Summary of earlier work"));
        assert!(prompts[0].contains("user wants Lisbon under 400 EUR"));
        assert!(prompts[0].contains("assistant: booked option A"));
        Ok(())
    }

    #[tokio::test]
    async fn nothing_to_condense_skips_the_call() -> anyhow::Result<()> {
        let generator = Arc::new(RecordingGenerator::default());
        let ctx = ctx(vec![
            turn(Role::System, "rules").with_importance(1.0),
            turn(Role::User, "latest"),
        ]);

        strategy(generator.clone(), 2)?.compact(&ctx).await?;

        assert!(generator.prompts.lock().is_empty());
        assert_eq!(ctx.scratchpad_len(), 2);
        assert_eq!(ctx.event_count(EventType::ScratchpadReplaced), 0);
        Ok(())
    }

    #[tokio::test]
    async fn generation_failure_is_the_strategy_error() -> anyhow::Result<()> {
        let generator = Arc::new(RecordingGenerator {
            fail: true,
            ..RecordingGenerator::default()
        });
        let ctx = ctx(vec![turn(Role::User, "a"), turn(Role::User, "b")]);

        let error = strategy(generator, 0)?.compact(&ctx).await.unwrap_err();
        assert!(format!("{error:#}").contains("model overloaded"));
        assert_eq!(ctx.scratchpad_len(), 2);
        Ok(())
    }

    #[test]
    fn invalid_template_is_rejected_up_front() {
        let config = SummarizationConfig {
            prompt_template: "{% if %}".to_owned(),
            ..SummarizationConfig::default()
        };
        let result = Summarization::new(Arc::new(RecordingGenerator::default()), config);
        assert!(matches!(result, Err(CadenceError::Template(_))));
    }
}
