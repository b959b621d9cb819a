//! Mission metrics: labeled counters, gauges, and value distributions.
//!
//! The registry is a process-wide singleton constructed at startup and
//! passed (or reached via [`global_metrics`]) into every subsystem. Values
//! use atomics; metric registration takes a write lock only on first use.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

// Well-known metric names. Counters unless noted.
pub mod name {
    /// Labeled by terminal `status`.
    pub const MISSIONS_TOTAL: &str = "missions_total";
    /// Labeled by `granted` ("true"/"false").
    pub const QUALITY_GATE_TOTAL: &str = "quality_gate_total";
    /// Labeled by `reason` (exhausted_retries, oscillation, policy).
    pub const ESCALATIONS_TOTAL: &str = "escalations_total";
    pub const FILE_OVERLAP_DEFERRALS_TOTAL: &str = "file_overlap_deferrals_total";
    /// Labeled by `resolved` ("true"/"false").
    pub const MERGE_CONFLICTS_TOTAL: &str = "merge_conflicts_total";
    pub const MERGE_RETRY_SUCCESS_TOTAL: &str = "merge_retry_success_total";
    /// Labeled by `op` and `success`.
    pub const WORKTREE_OPS_TOTAL: &str = "worktree_ops_total";
    /// Labeled by `strategy`.
    pub const WAVES_TOTAL: &str = "waves_total";
    /// Distribution: retry depth a task reached before settling.
    pub const TASK_ITERATIONS: &str = "task_iterations";
    /// Distribution: tasks per dispatched wave.
    pub const WAVE_SIZE: &str = "wave_size";
    /// Distribution: live worktrees during a wave.
    pub const ACTIVE_WORKTREES: &str = "active_worktrees";
    /// Timer (ms).
    pub const PLANNING_DURATION_MS: &str = "planning_duration_ms";
    /// Timer (ms), labeled by `agent`.
    pub const TASK_DURATION_MS: &str = "task_duration_ms";
}

/// A label set: sorted `key=value` pairs distinguishing series of one
/// metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, val)| ((*k).to_string(), (*val).to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    fn render(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

/// Running aggregate of observed values: count, sum, min, max.
///
/// Enough to answer the questions the distributions here get asked (mean
/// iteration depth, largest wave) without bucket bookkeeping.
#[derive(Debug, Default)]
struct Distribution {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Distribution {
    fn observe(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    fn new_with(value: u64) -> Self {
        Self {
            count: AtomicU64::new(1),
            sum: AtomicU64::new(value),
            min: AtomicU64::new(value),
            max: AtomicU64::new(value),
        }
    }
}

/// Central metrics registry: counters, gauges, distributions, timers.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicI64>>,
    distributions: RwLock<HashMap<(String, Labels), Distribution>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn incr(&self, metric: &str, labels: &[(&str, &str)]) {
        self.incr_by(metric, labels, 1);
    }

    pub fn incr_by(&self, metric: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (metric.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn counter(&self, metric: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (metric.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, metric: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
            if let Some(g) = map.get(metric) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        map.entry(metric.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, metric: &str) -> i64 {
        let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        map.get(metric).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Distributions & timers ---------------------------------------------

    pub fn observe(&self, metric: &str, labels: &[(&str, &str)], value: u64) {
        let key = (metric.to_string(), Labels::new(labels));
        {
            let map = self.distributions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(d) = map.get(&key) {
                d.observe(value);
                return;
            }
        }
        let mut map = self.distributions.write().unwrap_or_else(|e| e.into_inner());
        match map.get(&key) {
            Some(d) => d.observe(value),
            None => {
                map.insert(key, Distribution::new_with(value));
            }
        }
    }

    /// Record an elapsed duration in milliseconds against a timer metric.
    pub fn record_duration(&self, metric: &str, labels: &[(&str, &str)], started: Instant) {
        let elapsed_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        self.observe(metric, labels, elapsed_ms);
    }

    /// `(count, sum)` for a distribution series, `(0, 0)` if never observed.
    pub fn distribution(&self, metric: &str, labels: &[(&str, &str)]) -> (u64, u64) {
        let key = (metric.to_string(), Labels::new(labels));
        let map = self.distributions.read().unwrap_or_else(|e| e.into_inner());
        map.get(&key)
            .map(|d| {
                (
                    d.count.load(Ordering::Relaxed),
                    d.sum.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }

    // -- Export -------------------------------------------------------------

    /// Snapshot everything as JSON, series keyed `name{label=value,...}`.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        {
            let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
            for ((metric, labels), value) in map.iter() {
                counters.insert(
                    format!("{metric}{}", labels.render()),
                    serde_json::json!(value.load(Ordering::Relaxed)),
                );
            }
        }

        let mut gauges = serde_json::Map::new();
        {
            let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
            for (metric, value) in map.iter() {
                gauges.insert(
                    metric.clone(),
                    serde_json::json!(value.load(Ordering::Relaxed)),
                );
            }
        }

        let mut distributions = serde_json::Map::new();
        {
            let map = self.distributions.read().unwrap_or_else(|e| e.into_inner());
            for ((metric, labels), d) in map.iter() {
                distributions.insert(
                    format!("{metric}{}", labels.render()),
                    serde_json::json!({
                        "count": d.count.load(Ordering::Relaxed),
                        "sum": d.sum.load(Ordering::Relaxed),
                        "min": d.min.load(Ordering::Relaxed),
                        "max": d.max.load(Ordering::Relaxed),
                    }),
                );
            }
        }

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "distributions": distributions,
        })
    }
}

/// The process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsRegistry> = OnceLock::new();
    INSTANCE.get_or_init(MetricsRegistry::new)
}
