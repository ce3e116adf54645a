//! Metrics exposed by the client core.
//!
//! The core only talks to the [`MetricsRegistry`] trait. Two registries ship
//! with the crate:
//! - [`NoopMetricsRegistry`], the default, which records nothing shared
//! - [`InMemoryMetricsRegistry`], which keeps values for inspection
//!
//! Exported metrics:
//! - `connection.pool.retries` counter, total operation retries
//! - `connection.pool.size.active` / `.idle` / `.connected` gauges, tagged by server

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const RETRIES: &str = "connection.pool.retries";
pub const POOL_ACTIVE: &str = "connection.pool.size.active";
pub const POOL_IDLE: &str = "connection.pool.size.idle";
pub const POOL_CONNECTED: &str = "connection.pool.size.connected";

/// Reads a gauge value on demand
pub type GaugeSupplier = Box<dyn Fn() -> i64 + Send + Sync>;

/// Metric name plus its tags, rendered as `name{k=v,...}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(String);

impl MetricId {
    pub fn new(name: &str, tags: &[(&str, String)]) -> Self {
        if tags.is_empty() {
            return MetricId(name.to_string());
        }
        let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        MetricId(format!("{}{{{}}}", name, rendered.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    id: MetricId,
    value: AtomicU64,
}

impl Counter {
    pub fn new(id: MetricId) -> Self {
        Self {
            id,
            value: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &MetricId {
        &self.id
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sink for client metrics
pub trait MetricsRegistry: Send + Sync + fmt::Debug {
    /// Counter for `name`; repeated calls with the same id share one counter
    fn counter(&self, name: &str, tags: &[(&str, String)]) -> Arc<Counter>;

    /// Register a gauge read through `supplier`
    fn gauge(&self, name: &str, tags: &[(&str, String)], supplier: GaugeSupplier) -> MetricId;

    fn remove(&self, id: &MetricId);
}

/// Records nothing anyone can read back
#[derive(Debug, Default)]
pub struct NoopMetricsRegistry;

impl MetricsRegistry for NoopMetricsRegistry {
    fn counter(&self, name: &str, tags: &[(&str, String)]) -> Arc<Counter> {
        Arc::new(Counter::new(MetricId::new(name, tags)))
    }

    fn gauge(&self, name: &str, tags: &[(&str, String)], _supplier: GaugeSupplier) -> MetricId {
        MetricId::new(name, tags)
    }

    fn remove(&self, _id: &MetricId) {}
}

/// Keeps every metric in memory
#[derive(Default)]
pub struct InMemoryMetricsRegistry {
    counters: RwLock<HashMap<MetricId, Arc<Counter>>>,
    gauges: RwLock<HashMap<MetricId, GaugeSupplier>>,
}

impl InMemoryMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, tags: &[(&str, String)]) -> Option<u64> {
        self.counters
            .read()
            .get(&MetricId::new(name, tags))
            .map(|counter| counter.get())
    }

    pub fn gauge_value(&self, name: &str, tags: &[(&str, String)]) -> Option<i64> {
        self.gauges
            .read()
            .get(&MetricId::new(name, tags))
            .map(|supplier| supplier())
    }

    /// Current value of every metric, keyed by rendered id
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut values = BTreeMap::new();
        for (id, counter) in self.counters.read().iter() {
            values.insert(id.to_string(), counter.get() as i64);
        }
        for (id, supplier) in self.gauges.read().iter() {
            values.insert(id.to_string(), supplier());
        }
        values
    }
}

impl fmt::Debug for InMemoryMetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetricsRegistry")
            .field("counters", &self.counters.read().len())
            .field("gauges", &self.gauges.read().len())
            .finish()
    }
}

impl MetricsRegistry for InMemoryMetricsRegistry {
    fn counter(&self, name: &str, tags: &[(&str, String)]) -> Arc<Counter> {
        let id = MetricId::new(name, tags);
        if let Some(counter) = self.counters.read().get(&id) {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Counter::new(id))),
        )
    }

    fn gauge(&self, name: &str, tags: &[(&str, String)], supplier: GaugeSupplier) -> MetricId {
        let id = MetricId::new(name, tags);
        self.gauges.write().insert(id.clone(), supplier);
        id
    }

    fn remove(&self, id: &MetricId) {
        self.gauges.write().remove(id);
        self.counters.write().remove(id);
    }
}
