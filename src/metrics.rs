//! Injectable metrics sink (spec.md "Global state" design note: the crate
//! keeps no process-global state of its own). Callers that want counters
//! wire a `Arc<dyn Metrics>` through wherever they construct an `Agent`;
//! nothing in this crate reaches for a global registry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: i64);
    fn set_gauge(&self, name: &'static str, value: i64);

    fn incr(&self, name: &'static str) {
        self.incr_counter(name, 1);
    }
}

/// Default sink: every call is a no-op. Used wherever a caller hasn't
/// supplied its own `Metrics` implementation.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: i64) {}
    fn set_gauge(&self, _name: &'static str, _value: i64) {}
}

/// In-memory sink for tests: plain counters and gauges, read back via
/// `snapshot()`.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, AtomicI64>>,
    gauges: Mutex<HashMap<&'static str, i64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &'static str) -> i64 {
        self.counters.lock().get(name).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str) -> Option<i64> {
        self.gauges.lock().get(name).copied()
    }
}

impl Metrics for InMemoryMetrics {
    fn incr_counter(&self, name: &'static str, value: i64) {
        let mut counters = self.counters.lock();
        counters.entry(name).or_insert_with(|| AtomicI64::new(0)).fetch_add(value, Ordering::SeqCst);
    }

    fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges.lock().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let m = InMemoryMetrics::new();
        m.incr("probes_sent");
        m.incr("probes_sent");
        m.incr_counter("probes_sent", 3);
        assert_eq!(m.counter("probes_sent"), 5);
    }

    #[test]
    fn gauge_reflects_last_write() {
        let m = InMemoryMetrics::new();
        m.set_gauge("cluster_size", 4);
        m.set_gauge("cluster_size", 7);
        assert_eq!(m.gauge("cluster_size"), Some(7));
    }

    #[test]
    fn noop_sink_never_panics() {
        let m = NoopMetrics;
        m.incr("anything");
        m.set_gauge("anything", 1);
    }
}
