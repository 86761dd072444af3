use cadence_protocol::keys::{ITERATIONS, self_key};
use cadence_protocol::Limit;
use serde::{Deserialize, Serialize};

/// Executor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Checked in order after every iteration.
    pub limits: Vec<Limit>,
    /// Number of iterations a single node may run before it stops with a
    /// limit-exceeded reason. Zero stops before the first iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

impl ExecutorConfig {
    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Declared limits followed by the iteration budget, if any. The budget
    /// reads the node's own iteration twin so descendants never consume it.
    pub fn effective_limits(&self) -> Vec<Limit> {
        let mut limits = self.limits.clone();
        if let Some(max) = self.max_iterations {
            limits.push(Limit::exact(
                self_key(ITERATIONS),
                max.saturating_sub(1) as f64,
            ));
        }
        limits
    }
}
