//! Prometheus Metrics Sink
//!
//! Implements the `MetricsSink` port on a private `prometheus::Registry`.
//! Metric families are created on first use, named `{namespace}_{name}`
//! with the label names of that first call. A later call with a different
//! label set is dropped with a warning.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::domain::ports::{Labels, MetricsSink};
use crate::error::{Error, Result};

/// Default histogram buckets, seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

struct Family<V> {
    labels: Vec<String>,
    vec: V,
}

impl<V> Family<V> {
    fn matches(&self, label_names: &[&str]) -> bool {
        self.labels.iter().map(String::as_str).eq(label_names.iter().copied())
    }
}

pub struct PrometheusSink {
    namespace: String,
    registry: Registry,
    counters: DashMap<String, Family<IntCounterVec>>,
    gauges: DashMap<String, Family<GaugeVec>>,
    histograms: DashMap<String, Family<HistogramVec>>,
    /// Families already reported as misused
    rejected: Mutex<HashSet<String>>,
}

impl PrometheusSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            registry: Registry::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every family in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    fn full_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    fn reject(&self, name: &str, reason: impl std::fmt::Display) {
        if self.rejected.lock().insert(name.to_string()) {
            warn!(metric = name, error = %reason, "Dropping metric");
        }
    }

    /// Look up a family, creating and registering it on first use.
    fn family<V: Clone>(
        &self,
        cache: &DashMap<String, Family<V>>,
        name: &str,
        label_names: &[&str],
        create: impl FnOnce(String) -> prometheus::Result<V>,
    ) -> Option<V> {
        if let Some(family) = cache.get(name) {
            if family.matches(label_names) {
                return Some(family.vec.clone());
            }
        }
        match cache.entry(name.to_string()) {
            Entry::Occupied(family) if family.get().matches(label_names) => {
                Some(family.get().vec.clone())
            }
            Entry::Occupied(family) => {
                let expected = family.get().labels.join(",");
                drop(family);
                self.reject(name, format!("expected labels [{}]", expected));
                None
            }
            Entry::Vacant(slot) => match create(self.full_name(name)) {
                Ok(vec) => {
                    slot.insert(Family {
                        labels: label_names.iter().map(|l| l.to_string()).collect(),
                        vec: vec.clone(),
                    });
                    Some(vec)
                }
                Err(e) => {
                    drop(slot);
                    self.reject(name, e);
                    None
                }
            },
        }
    }

    fn counter_vec(&self, name: &str, label_names: &[&str]) -> Option<IntCounterVec> {
        self.family(&self.counters, name, label_names, |full| {
            let vec = IntCounterVec::new(Opts::new(full, help(name)), label_names)?;
            self.registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        })
    }

    fn gauge_vec(&self, name: &str, label_names: &[&str]) -> Option<GaugeVec> {
        self.family(&self.gauges, name, label_names, |full| {
            let vec = GaugeVec::new(Opts::new(full, help(name)), label_names)?;
            self.registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        })
    }

    fn histogram_vec(&self, name: &str, label_names: &[&str]) -> Option<HistogramVec> {
        self.family(&self.histograms, name, label_names, |full| {
            let opts = HistogramOpts::new(full, help(name)).buckets(LATENCY_BUCKETS.to_vec());
            let vec = HistogramVec::new(opts, label_names)?;
            self.registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        })
    }
}

fn help(name: &str) -> String {
    name.replace('_', " ")
}

fn split(labels: Labels<'_>) -> (Vec<&str>, Vec<&str>) {
    labels.iter().map(|(k, v)| (*k, *v)).unzip()
}

impl MetricsSink for PrometheusSink {
    fn counter(&self, name: &str, labels: Labels<'_>, value: u64) {
        let (names, values) = split(labels);
        if let Some(vec) = self.counter_vec(name, &names) {
            match vec.get_metric_with_label_values(values.as_slice()) {
                Ok(c) => c.inc_by(value),
                Err(e) => self.reject(name, e),
            }
        }
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let (names, values) = split(labels);
        if let Some(vec) = self.gauge_vec(name, &names) {
            match vec.get_metric_with_label_values(values.as_slice()) {
                Ok(g) => g.set(value),
                Err(e) => self.reject(name, e),
            }
        }
    }

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        let (names, values) = split(labels);
        if let Some(vec) = self.histogram_vec(name, &names) {
            match vec.get_metric_with_label_values(values.as_slice()) {
                Ok(h) => h.observe(value),
                Err(e) => self.reject(name, e),
            }
        }
    }
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("namespace", &self.namespace)
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge_exported() {
        let sink = PrometheusSink::new("couchestor");
        sink.counter("cache_hits_total", &[("tier", "hot")], 3);
        sink.counter("cache_hits_total", &[("tier", "hot")], 2);
        sink.gauge("replication_in_flight", &[], 7.0);

        let text = sink.encode().unwrap();
        assert!(text.contains("couchestor_cache_hits_total{tier=\"hot\"} 5"));
        assert!(text.contains("couchestor_replication_in_flight 7"));
    }

    #[test]
    fn test_histogram_exported() {
        let sink = PrometheusSink::new("couchestor");
        sink.histogram("request_seconds", &[("op", "get")], 0.003);
        let text = sink.encode().unwrap();
        assert!(text.contains("couchestor_request_seconds_count{op=\"get\"} 1"));
    }

    #[test]
    fn test_mismatched_labels_are_dropped() {
        let sink = PrometheusSink::new("");
        sink.counter("ops_total", &[("op", "put")], 1);
        // Different label names for an existing family
        sink.counter("ops_total", &[("tenant", "t1")], 1);
        let text = sink.encode().unwrap();
        assert!(text.contains("ops_total{op=\"put\"} 1"));
        assert!(!text.contains("tenant=\"t1\""));
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = PrometheusSink::new("a");
        let b = PrometheusSink::new("a");
        a.counter("x_total", &[], 1);
        b.counter("x_total", &[], 1);
        assert!(a.encode().unwrap().contains("a_x_total 1"));
        assert!(b.encode().unwrap().contains("a_x_total 1"));
    }
}
