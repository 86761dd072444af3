//! Scratchpad items.
//!
//! An [`Iteration`] is one turn of working memory. Items are created by the
//! loop body and only ever replaced wholesale by a compaction strategy.

use crate::message::{Message, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Importance at or above which an item is pinned and never evicted.
pub const PIN_IMPORTANCE: f64 = 0.9;

/// Where a scratchpad item came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Original,
    SyntheticSummary,
    ModifiedInPlace,
    RetrievedHistory,
}

/// Typed metadata keys plus an open extension map for user-defined keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    /// Loop iteration that produced the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    /// For synthetic summaries: how many original items the summary covers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarized_count: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub metadata: IterationMetadata,
}

impl Iteration {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            origin: Origin::Original,
            metadata: IterationMetadata::default(),
        }
    }

    /// Single text message turn.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(vec![Message::text(role, text)])
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.metadata.importance = Some(importance);
        self
    }

    pub fn with_turn(mut self, turn: u64) -> Self {
        self.metadata.turn = Some(turn);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.extensions.insert(key.into(), value);
        self
    }

    pub fn is_pinned(&self) -> bool {
        self.metadata
            .importance
            .is_some_and(|importance| importance >= PIN_IMPORTANCE)
    }

    pub fn is_summary(&self) -> bool {
        self.origin == Origin::SyntheticSummary
    }

    /// Text of every message, one `role: text` line per message that carries
    /// any text.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .filter_map(|message| {
                let text = message.text_content();
                (!text.trim().is_empty()).then(|| format!("{}: {}", message.role.as_str(), text))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
