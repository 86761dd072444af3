//! Well-known stat keys.
//!
//! Keys under [`SELF_PREFIX`] form the local-only namespace: they are derived
//! by the stats engine from direct counter increments and can never be
//! written by callers.

/// Prefix of the local-only twin of every counter.
pub const SELF_PREFIX: &str = "self:";

/// Protected counter advanced once per loop iteration by the executor.
pub const ITERATIONS: &str = "iterations";
/// Incremented every time a compaction event is published.
pub const COMPACTIONS: &str = "compactions";

/// Gauge holding the current scratchpad length of a node.
pub const SCRATCHPAD_LENGTH: &str = "scratchpad.length";

/// Prefix of gauges reset at the start of every iteration.
pub const ITERATION_GAUGE_PREFIX: &str = "iteration.";
/// Wall-clock duration of the last loop-body call.
pub const ITERATION_DURATION_MS: &str = "iteration.duration_ms";
/// Tokens consumed by generative calls within the current iteration.
pub const ITERATION_TOKENS: &str = "iteration.tokens";

/// Size of the most recent prompt sent to the generative capability.
pub const CONTEXT_TOKENS: &str = "context.tokens";

pub const LLM_CALLS: &str = "llm.calls";
pub const LLM_PROMPT_TOKENS: &str = "llm.tokens.prompt";
pub const LLM_COMPLETION_TOKENS: &str = "llm.tokens.completion";
pub const LLM_TOTAL_TOKENS: &str = "llm.tokens.total";

/// Local-only twin of `key`.
pub fn self_key(key: &str) -> String {
    format!("{SELF_PREFIX}{key}")
}

pub fn is_self_key(key: &str) -> bool {
    key.starts_with(SELF_PREFIX)
}

/// Whether `candidate` falls under `prefix`, treating the local-only
/// namespace as disjoint from the unprefixed one: an ordinary prefix never
/// matches a `self:` key and a `self:` prefix never matches an ordinary key.
pub fn prefix_matches(prefix: &str, candidate: &str) -> bool {
    if is_self_key(prefix) != is_self_key(candidate) {
        return false;
    }
    candidate.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_key_round_trip() {
        assert_eq!(self_key("tokens"), "self:tokens");
        assert!(is_self_key(&self_key("tokens")));
        assert!(!is_self_key("tokens"));
    }

    #[test]
    fn empty_prefix_does_not_reach_into_local_namespace() {
        assert!(prefix_matches("", "llm.calls"));
        assert!(!prefix_matches("", "self:llm.calls"));
        assert!(!prefix_matches("self", "self:llm.calls"));
        assert!(prefix_matches("self:llm", "self:llm.calls"));
        assert!(!prefix_matches("self:llm", "llm.calls"));
    }
}
