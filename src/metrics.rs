//! Metrics and tracing sink for mesh components.
//!
//! Components emit counters, gauges, histograms, and span-style events
//! through a [`MetricsSink`]. Sinks can log, aggregate in memory, or forward
//! to external systems; the mesh only depends on the trait.
//!
//! The in-memory sink doubles as the source for Prometheus-style text
//! exposition via [`render_prometheus`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// Destination for mesh telemetry. Implementations must be cheap on the hot
/// path; the mesh never awaits a sink.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn counter(&self, name: &str, labels: &[(&str, &str)], value: u64);
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
    /// Span-style event (state transitions, terminal errors).
    fn event(&self, name: &str, fields: &[(&str, &str)]);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn counter(&self, _name: &str, _labels: &[(&str, &str)], _value: u64) {}
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn event(&self, _name: &str, _fields: &[(&str, &str)]) {}
}

/// Sink that forwards everything to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        tracing::debug!(metric = name, ?labels, value, "counter");
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        tracing::debug!(metric = name, ?labels, value, "gauge");
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        tracing::debug!(metric = name, ?labels, value, "histogram");
    }

    fn event(&self, name: &str, fields: &[(&str, &str)]) {
        tracing::info!(event = name, ?fields, "mesh event");
    }
}

/// Max samples retained per histogram series in [`MemorySink`]. Oldest samples
/// are dropped first; counts and sums keep the full history.
const MEMORY_HISTOGRAM_CAP: usize = 10_000;

#[derive(Debug, Default, Clone)]
struct HistogramSeries {
    count: u64,
    sum: f64,
    samples: Vec<f64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, HistogramSeries>,
    events: Vec<(String, Vec<(String, String)>)>,
}

/// Sink that aggregates in memory for tests and exposition.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut key = String::with_capacity(name.len() + 16 * sorted.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        let _ = write!(key, "{}=\"{}\"", k, v);
    }
    key.push('}');
    key
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, 0 if never incremented.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.state.lock().expect("MemorySink poisoned").counters.get(&key).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(name, labels);
        self.state.lock().expect("MemorySink poisoned").gauges.get(&key).copied()
    }

    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.state
            .lock()
            .expect("MemorySink poisoned")
            .histograms
            .get(&key)
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.state.lock().expect("MemorySink poisoned").events.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("MemorySink poisoned");
        *state = MemoryState::default();
    }
}

impl MetricsSink for MemorySink {
    fn counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let key = series_key(name, labels);
        let mut state = self.state.lock().expect("MemorySink poisoned");
        *state.counters.entry(key).or_insert(0) += value;
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        let mut state = self.state.lock().expect("MemorySink poisoned");
        state.gauges.insert(key, value);
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        let mut state = self.state.lock().expect("MemorySink poisoned");
        let series = state.histograms.entry(key).or_default();
        series.count += 1;
        series.sum += value;
        if series.samples.len() >= MEMORY_HISTOGRAM_CAP {
            series.samples.remove(0);
        }
        series.samples.push(value);
    }

    fn event(&self, name: &str, fields: &[(&str, &str)]) {
        let mut state = self.state.lock().expect("MemorySink poisoned");
        state.events.push((
            name.to_string(),
            fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        ));
    }
}

/// Render a [`MemorySink`] snapshot as Prometheus text exposition format.
///
/// Counters render as `<name> <value>`, gauges likewise, histograms as
/// `_count`/`_sum` pairs. Series keys already carry their label sets.
pub fn render_prometheus(sink: &MemorySink) -> String {
    let state = sink.state.lock().expect("MemorySink poisoned");
    let mut out = String::new();
    for (key, value) in &state.counters {
        let _ = writeln!(out, "{} {}", key, value);
    }
    for (key, value) in &state.gauges {
        let _ = writeln!(out, "{} {}", key, value);
    }
    for (key, series) in &state.histograms {
        let (name, labels) = match key.find('{') {
            Some(idx) => (&key[..idx], &key[idx..]),
            None => (key.as_str(), ""),
        };
        let _ = writeln!(out, "{}_count{} {}", name, labels, series.count);
        let _ = writeln!(out, "{}_sum{} {}", name, labels, series.sum);
    }
    out
}
