//! In-process Metrics Collector
//!
//! A dependency-free [`MetricsSink`] that keeps every series in memory and
//! renders it in the Prometheus text format. Used by tests and by embedders
//! that scrape the core without a registry.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::ports::{Labels, MetricsSink};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last-value gauge, stored as `f64` bits
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    /// Sum in micro-units
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Latency buckets in seconds.
    pub fn latency() -> Self {
        Self::with_buckets(vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
        ])
    }

    pub fn with_buckets(mut bounds: Vec<f64>) -> Self {
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value.max(0.0) * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative `(upper bound, count)` pairs.
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .zip(&self.buckets)
            .map(|(le, c)| (*le, c.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::latency()
    }
}

/// Metric name plus its label pairs, sorted by label name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    pub fn new(name: &str, labels: Labels<'_>) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn render(&self, suffix: &str, extra: Option<(&str, String)>) -> String {
        let mut out = format!("{}{}", self.name, suffix);
        let pairs: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
            .chain(extra.map(|(k, v)| format!("{}=\"{}\"", k, v)))
            .collect();
        if !pairs.is_empty() {
            out.push('{');
            out.push_str(&pairs.join(","));
            out.push('}');
        }
        out
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Lock-free collector keyed by series.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<SeriesKey, Arc<Counter>>,
    gauges: DashMap<SeriesKey, Arc<Gauge>>,
    histograms: DashMap<SeriesKey, Arc<Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_handle(&self, name: &str, labels: Labels<'_>) -> Arc<Counter> {
        self.counters
            .entry(SeriesKey::new(name, labels))
            .or_default()
            .clone()
    }

    pub fn gauge_handle(&self, name: &str, labels: Labels<'_>) -> Arc<Gauge> {
        self.gauges
            .entry(SeriesKey::new(name, labels))
            .or_default()
            .clone()
    }

    pub fn histogram_handle(&self, name: &str, labels: Labels<'_>) -> Arc<Histogram> {
        self.histograms
            .entry(SeriesKey::new(name, labels))
            .or_default()
            .clone()
    }

    /// Current counter value, 0 when the series does not exist.
    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&SeriesKey::new(name, labels))
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges
            .get(&SeriesKey::new(name, labels))
            .map(|g| g.get())
    }

    pub fn histogram_count(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.histograms
            .get(&SeriesKey::new(name, labels))
            .map(|h| h.count())
            .unwrap_or(0)
    }

    /// Render all series in the Prometheus text format, sorted by name.
    pub fn export_text(&self) -> String {
        let mut families: BTreeMap<String, (&'static str, Vec<String>)> = BTreeMap::new();

        for entry in self.counters.iter() {
            let line = format!("{} {}", entry.key().render("", None), entry.value().get());
            families
                .entry(entry.key().name.clone())
                .or_insert(("counter", Vec::new()))
                .1
                .push(line);
        }
        for entry in self.gauges.iter() {
            let line = format!("{} {}", entry.key().render("", None), entry.value().get());
            families
                .entry(entry.key().name.clone())
                .or_insert(("gauge", Vec::new()))
                .1
                .push(line);
        }
        for entry in self.histograms.iter() {
            let (key, h) = (entry.key(), entry.value());
            let lines = &mut families
                .entry(key.name.clone())
                .or_insert(("histogram", Vec::new()))
                .1;
            for (le, count) in h.buckets() {
                lines.push(format!(
                    "{} {}",
                    key.render("_bucket", Some(("le", le.to_string()))),
                    count
                ));
            }
            lines.push(format!(
                "{} {}",
                key.render("_bucket", Some(("le", "+Inf".to_string()))),
                h.count()
            ));
            lines.push(format!("{} {}", key.render("_sum", None), h.sum()));
            lines.push(format!("{} {}", key.render("_count", None), h.count()));
        }

        let mut out = String::new();
        for (name, (kind, mut lines)) in families {
            lines.sort();
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            for line in lines {
                let _ = writeln!(out, "{}", line);
            }
        }
        out
    }
}

impl MetricsSink for MetricsCollector {
    fn counter(&self, name: &str, labels: Labels<'_>, value: u64) {
        self.counter_handle(name, labels).add(value);
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.gauge_handle(name, labels).set(value);
    }

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.histogram_handle(name, labels).observe(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates_per_series() {
        let c = MetricsCollector::new();
        c.counter("requests_total", &[("op", "get")], 2);
        c.counter("requests_total", &[("op", "get")], 3);
        c.counter("requests_total", &[("op", "put")], 1);
        assert_eq!(c.counter_value("requests_total", &[("op", "get")]), 5);
        assert_eq!(c.counter_value("requests_total", &[("op", "put")]), 1);
        assert_eq!(c.counter_value("requests_total", &[("op", "delete")]), 0);
    }

    #[test]
    fn test_label_order_is_irrelevant() {
        let c = MetricsCollector::new();
        c.counter("x", &[("a", "1"), ("b", "2")], 1);
        c.counter("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(c.counter_value("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let c = MetricsCollector::new();
        c.gauge("lag_millis", &[], 10.0);
        c.gauge("lag_millis", &[], 2.5);
        assert_eq!(c.gauge_value("lag_millis", &[]), Some(2.5));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::with_buckets(vec![1.0, 0.1, 10.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(20.0);
        assert_eq!(h.count(), 3);
        assert_eq!(h.buckets(), vec![(0.1, 1), (1.0, 2), (10.0, 2)]);
        assert!((h.sum() - 20.55).abs() < 1e-6);
    }

    #[test]
    fn test_export_text() {
        let c = MetricsCollector::new();
        c.counter("evictions_total", &[("tier", "hot")], 4);
        c.gauge("in_flight", &[], 3.0);
        c.histogram("latency_seconds", &[("op", "put")], 0.002);

        let text = c.export_text();
        assert!(text.contains("# TYPE evictions_total counter"));
        assert!(text.contains("evictions_total{tier=\"hot\"} 4"));
        assert!(text.contains("in_flight 3"));
        assert!(text.contains("latency_seconds_bucket{op=\"put\",le=\"+Inf\"} 1"));
        assert!(text.contains("latency_seconds_count{op=\"put\"} 1"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let c = MetricsCollector::new();
        c.counter("x", &[("k", "a\"b")], 1);
        assert!(c.export_text().contains("x{k=\"a\\\"b\"} 1"));
    }
}
