//! Limit evaluation over a stats snapshot.

use cadence_protocol::keys::prefix_matches;
use cadence_protocol::{KeyMatch, Limit};

use crate::stats::{Stats, StatsSnapshot};

impl StatsSnapshot {
    /// Counter value if the key is a counter, else the gauge value.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.counters
            .get(key)
            .map(|value| *value as f64)
            .or_else(|| self.gauges.get(key).copied())
    }

    /// Every counter then every gauge whose key falls under `prefix`.
    pub fn matching<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        let counters = self
            .counters
            .iter()
            .map(|(key, value)| (key.as_str(), *value as f64));
        let gauges = self
            .gauges
            .iter()
            .map(|(key, value)| (key.as_str(), *value));
        counters
            .chain(gauges)
            .filter(move |(key, _)| prefix_matches(prefix, key))
    }

    pub fn exceeds(&self, limit: &Limit) -> bool {
        match limit.mode {
            KeyMatch::Exact => self
                .value(&limit.key)
                .is_some_and(|value| limit.is_exceeded_by(value)),
            KeyMatch::Prefix => self
                .matching(&limit.key)
                .any(|(_, value)| limit.is_exceeded_by(value)),
        }
    }

    /// First limit, in declaration order, whose tracked value strictly
    /// exceeds its threshold.
    pub fn check_limits<'a>(&self, limits: &'a [Limit]) -> Option<&'a Limit> {
        limits.iter().find(|limit| self.exceeds(limit))
    }
}

impl Stats {
    pub fn check_limits(&self, limits: &[Limit]) -> Option<Limit> {
        self.snapshot().check_limits(limits).cloned()
    }
}
