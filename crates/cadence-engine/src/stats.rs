//! Per-node counters and gauges with upward counter propagation.
//!
//! A direct counter increment on a node writes the base key and its
//! local-only twin (`self:<key>`) on that node, then adds the same delta to
//! the base key of every ancestor. Each node's base value is therefore the
//! sum over its subtree and its twin is strictly its own contribution.
//! Gauges are purely local.
//!
//! Every node has its own lock. Propagation releases the node's lock before
//! touching the parent and then takes each ancestor's lock on its own, so
//! concurrent children never hold two locks at once.

use std::sync::Arc;

use cadence_protocol::keys::{self, is_self_key, self_key};
use cadence_protocol::{CadenceError, CadenceResult};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default)]
struct StatsInner {
    counters: IndexMap<String, i64>,
    gauges: IndexMap<String, f64>,
}

#[derive(Debug)]
pub struct Stats {
    parent: Option<Arc<Stats>>,
    inner: RwLock<StatsInner>,
}

/// Point-in-time copy of one node's stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: IndexMap<String, i64>,
    pub gauges: IndexMap<String, f64>,
}

impl Stats {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            inner: RwLock::new(StatsInner::default()),
        })
    }

    /// Stats chained to `parent`: counter increments here also reach it.
    pub fn child(parent: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent),
            inner: RwLock::new(StatsInner::default()),
        })
    }

    pub fn parent(&self) -> Option<&Arc<Stats>> {
        self.parent.as_ref()
    }

    /// Add `delta` to counter `key` on this node and every ancestor.
    ///
    /// Fails on a negative delta or a key in the local-only namespace and
    /// leaves every node untouched. Writes to the protected iteration counter
    /// are ignored; only the executor advances it.
    pub fn incr_counter(&self, key: &str, delta: i64) -> CadenceResult<()> {
        if delta < 0 {
            return Err(CadenceError::NegativeDelta {
                key: key.to_owned(),
                delta,
            });
        }
        if is_self_key(key) {
            return Err(CadenceError::ReservedKey(key.to_owned()));
        }
        if key == keys::ITERATIONS {
            warn!(key, delta, "ignoring external write to protected iteration counter");
            return Ok(());
        }
        self.apply_direct(key, delta);
        Ok(())
    }

    pub(crate) fn advance_iteration(&self) {
        self.apply_direct(keys::ITERATIONS, 1);
    }

    /// Increment for keys the engine itself owns. Callers guarantee a valid,
    /// non-negative write.
    pub(crate) fn record(&self, key: &str, delta: i64) {
        debug_assert!(delta >= 0 && !is_self_key(key));
        self.apply_direct(key, delta);
    }

    fn apply_direct(&self, key: &str, delta: i64) {
        {
            let mut inner = self.inner.write();
            add_counter(&mut inner.counters, key.to_owned(), delta);
            add_counter(&mut inner.counters, self_key(key), delta);
        }
        let mut ancestor = self.parent.as_ref();
        while let Some(stats) = ancestor {
            stats.apply_propagated(key, delta);
            ancestor = stats.parent.as_ref();
        }
    }

    fn apply_propagated(&self, key: &str, delta: i64) {
        let mut inner = self.inner.write();
        add_counter(&mut inner.counters, key.to_owned(), delta);
    }

    /// Gauge delta may be negative. Never propagates.
    pub fn incr_gauge(&self, key: &str, delta: f64) -> CadenceResult<()> {
        ensure_writable(key)?;
        *self.inner.write().gauges.entry(key.to_owned()).or_insert(0.0) += delta;
        Ok(())
    }

    pub fn set_gauge(&self, key: &str, value: f64) -> CadenceResult<()> {
        ensure_writable(key)?;
        self.put_gauge(key, value);
        Ok(())
    }

    pub(crate) fn put_gauge(&self, key: &str, value: f64) {
        self.inner.write().gauges.insert(key.to_owned(), value);
    }

    pub(crate) fn add_gauge(&self, key: &str, delta: f64) {
        *self.inner.write().gauges.entry(key.to_owned()).or_insert(0.0) += delta;
    }

    /// Sets the gauge back to zero.
    pub fn reset_gauge(&self, key: &str) -> CadenceResult<()> {
        self.set_gauge(key, 0.0)
    }

    /// Zero every gauge whose key starts with `prefix`.
    pub fn reset_gauges_with_prefix(&self, prefix: &str) {
        let mut inner = self.inner.write();
        for (key, value) in inner.gauges.iter_mut() {
            if keys::prefix_matches(prefix, key) {
                *value = 0.0;
            }
        }
    }

    pub fn get_counter(&self, key: &str) -> i64 {
        self.inner.read().counters.get(key).copied().unwrap_or(0)
    }

    /// Direct contributions of this node alone.
    pub fn get_self_counter(&self, key: &str) -> i64 {
        self.get_counter(&self_key(key))
    }

    pub fn get_gauge(&self, key: &str) -> f64 {
        self.inner.read().gauges.get(key).copied().unwrap_or(0.0)
    }

    pub fn counters(&self) -> IndexMap<String, i64> {
        self.inner.read().counters.clone()
    }

    pub fn gauges(&self) -> IndexMap<String, f64> {
        self.inner.read().gauges.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        StatsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }
}

fn ensure_writable(key: &str) -> CadenceResult<()> {
    if is_self_key(key) {
        return Err(CadenceError::ReservedKey(key.to_owned()));
    }
    Ok(())
}

fn add_counter(counters: &mut IndexMap<String, i64>, key: String, delta: i64) {
    let value = counters.entry(key).or_insert(0);
    *value = value.saturating_add(delta);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Arc<Stats>, Arc<Stats>, Arc<Stats>) {
        let root = Stats::root();
        let child = Stats::child(root.clone());
        let grandchild = Stats::child(child.clone());
        (root, child, grandchild)
    }

    #[test]
    fn counters_aggregate_up_and_twins_stay_local() {
        let (root, child, grandchild) = chain();
        root.incr_counter("llm.calls", 1).unwrap();
        child.incr_counter("llm.calls", 2).unwrap();
        grandchild.incr_counter("llm.calls", 4).unwrap();

        assert_eq!(root.get_counter("llm.calls"), 7);
        assert_eq!(child.get_counter("llm.calls"), 6);
        assert_eq!(grandchild.get_counter("llm.calls"), 4);

        assert_eq!(root.get_self_counter("llm.calls"), 1);
        assert_eq!(child.get_self_counter("llm.calls"), 2);
        assert_eq!(grandchild.get_self_counter("llm.calls"), 4);
    }

    #[test]
    fn negative_delta_fails_and_changes_nothing() {
        let (root, child, _) = chain();
        child.incr_counter("tool.calls", 3).unwrap();
        let before_root = root.snapshot();
        let before_child = child.snapshot();

        let error = child.incr_counter("tool.calls", -1).unwrap_err();
        assert_eq!(
            error,
            CadenceError::NegativeDelta {
                key: "tool.calls".to_owned(),
                delta: -1
            }
        );
        assert_eq!(root.snapshot(), before_root);
        assert_eq!(child.snapshot(), before_child);
    }

    #[test]
    fn local_namespace_rejects_direct_writes() {
        let stats = Stats::root();
        assert!(matches!(
            stats.incr_counter("self:tokens", 1),
            Err(CadenceError::ReservedKey(_))
        ));
        assert!(matches!(
            stats.set_gauge("self:depth", 1.0),
            Err(CadenceError::ReservedKey(_))
        ));
        assert!(stats.counters().is_empty());
        assert!(stats.gauges().is_empty());
    }

    #[test]
    fn protected_iteration_counter_ignores_external_writes() {
        let (root, child, _) = chain();
        child.incr_counter(keys::ITERATIONS, 5).unwrap();
        assert_eq!(child.get_counter(keys::ITERATIONS), 0);

        child.advance_iteration();
        child.advance_iteration();
        assert_eq!(child.get_counter(keys::ITERATIONS), 2);
        assert_eq!(child.get_self_counter(keys::ITERATIONS), 2);
        assert_eq!(root.get_counter(keys::ITERATIONS), 2);
        assert_eq!(root.get_self_counter(keys::ITERATIONS), 0);
    }

    #[test]
    fn gauges_never_propagate() {
        let (root, child, _) = chain();
        root.set_gauge("context.tokens", 10.0).unwrap();
        child.incr_gauge("context.tokens", 5.0).unwrap();
        child.incr_gauge("context.tokens", -2.0).unwrap();

        assert_eq!(child.get_gauge("context.tokens"), 3.0);
        assert_eq!(root.get_gauge("context.tokens"), 10.0);
        assert!(root.counters().is_empty());
    }

    #[test]
    fn prefix_reset_only_touches_matching_gauges() {
        let stats = Stats::root();
        stats.set_gauge("iteration.tokens", 42.0).unwrap();
        stats.set_gauge("iteration.duration_ms", 7.0).unwrap();
        stats.set_gauge("context.tokens", 900.0).unwrap();

        stats.reset_gauges_with_prefix("iteration.");
        assert_eq!(stats.get_gauge("iteration.tokens"), 0.0);
        assert_eq!(stats.get_gauge("iteration.duration_ms"), 0.0);
        assert_eq!(stats.get_gauge("context.tokens"), 900.0);

        stats.reset_gauge("context.tokens").unwrap();
        assert_eq!(stats.get_gauge("context.tokens"), 0.0);
    }

    #[test]
    fn bulk_accessors_return_copies() {
        let stats = Stats::root();
        stats.incr_counter("a", 1).unwrap();
        let mut copy = stats.counters();
        copy.insert("a".to_owned(), 100);
        assert_eq!(stats.get_counter("a"), 1);
    }

    #[test]
    fn concurrent_children_aggregate_without_loss() {
        let root = Stats::root();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let child = Stats::child(root.clone());
                std::thread::spawn(move || {
                    let grandchild = Stats::child(child.clone());
                    for _ in 0..500 {
                        child.incr_counter("work", 1).unwrap();
                        grandchild.incr_counter("work", 2).unwrap();
                    }
                    (child.get_self_counter("work"), child.get_counter("work"))
                })
            })
            .collect();

        for handle in handles {
            let (own, subtree) = handle.join().unwrap();
            assert_eq!(own, 500);
            assert_eq!(subtree, 1500);
        }
        assert_eq!(root.get_counter("work"), 8 * 1500);
        assert_eq!(root.get_self_counter("work"), 0);
    }
}
