//! Failure prediction from per-service metric time series.
//!
//! The predictor keeps a ring of samples per (service, metric) and combines
//! four signals into a failure likelihood:
//!
//! - threshold: the latest value crossed the metric's hard limit
//! - anomaly: z-score above `anomaly_threshold` against the rolling mean
//! - trend: a linear-regression forecast at `t + window/3` crosses the limit
//! - forecast: moving-average extrapolation crosses the limit
//!
//! `likelihood = clamp01(0.4·threshold + 0.3·anomaly + 0.2·trend + 0.1·forecast)`,
//! `confidence = samples / min_samples` capped at 1. Below `min_samples`
//! the predictor reports `(0, 0)` and callers treat the service as healthy.

use crate::clock::Clock;
use crate::config::PredictorConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Metrics the predictor observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    ErrorRate,
    Latency,
    Cpu,
    Memory,
    RequestRate,
    QueueSize,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::Latency => "latency",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::RequestRate => "request_rate",
            Self::QueueSize => "queue_size",
        }
    }
}

/// Which detector produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Threshold,
    Anomaly,
    Trend,
    Forecast,
}

/// One contributing signal in a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub metric: MetricKind,
    pub kind: SignalKind,
    /// Strength in `[0, 1]`.
    pub strength: f64,
}

/// Prediction for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub likelihood: f64,
    pub confidence: f64,
    pub signals: Vec<Signal>,
}

impl Prediction {
    pub fn cold_start() -> Self {
        Self { likelihood: 0.0, confidence: 0.0, signals: Vec::new() }
    }

    /// The admission-control product used by the predictive breaker strategy.
    pub fn risk(&self) -> f64 {
        self.likelihood * self.confidence
    }
}

#[derive(Debug, Clone, Copy)]
struct SeriesPoint {
    at_millis: u64,
    value: f64,
}

#[derive(Debug, Default)]
struct Series {
    points: VecDeque<SeriesPoint>,
}

impl Series {
    /// Append a sample. Timestamps must be monotone non-decreasing; stale
    /// samples are dropped rather than reordered.
    fn push(&mut self, point: SeriesPoint, capacity: usize) {
        if let Some(last) = self.points.back() {
            if point.at_millis < last.at_millis {
                return;
            }
        }
        if self.points.len() >= capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Samples inside `[now − window, now]`, oldest first. Never stale data.
    fn in_window(&self, now: u64, window_ms: u64) -> Vec<SeriesPoint> {
        let cutoff = now.saturating_sub(window_ms);
        self.points.iter().filter(|p| p.at_millis >= cutoff).copied().collect()
    }
}

/// Forecasts failure likelihood per service from metric time series.
///
/// Series are owned by the predictor and never shared; consumers read by
/// copy through [`predict`](Self::predict).
#[derive(Debug)]
pub struct FailurePredictor {
    config: PredictorConfig,
    clock: Arc<dyn Clock>,
    thresholds: RwLock<HashMap<MetricKind, f64>>,
    series: RwLock<HashMap<(String, MetricKind), Series>>,
    capacity: usize,
}

impl FailurePredictor {
    pub fn new(config: PredictorConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity =
            (config.window_s / config.resolution_s.max(1)).max(1) as usize;
        let mut thresholds = HashMap::new();
        thresholds.insert(MetricKind::ErrorRate, 0.05);
        thresholds.insert(MetricKind::Latency, 1_000.0);
        thresholds.insert(MetricKind::Cpu, 0.8);
        thresholds.insert(MetricKind::Memory, 0.8);
        Self {
            config,
            clock,
            thresholds: RwLock::new(thresholds),
            series: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Override the hard limit for a metric. Metrics without a limit only
    /// contribute anomaly signals.
    pub fn set_threshold(&self, metric: MetricKind, limit: f64) {
        self.thresholds.write().expect("predictor poisoned").insert(metric, limit);
    }

    /// Record one sample for (service, metric).
    pub fn observe(&self, service: &str, metric: MetricKind, value: f64) {
        if !value.is_finite() {
            return;
        }
        let now = self.clock.now_millis();
        let mut series = self.series.write().expect("predictor poisoned");
        series
            .entry((service.to_string(), metric))
            .or_default()
            .push(SeriesPoint { at_millis: now, value }, self.capacity);
    }

    /// Predict failure likelihood for `service`.
    pub fn predict(&self, service: &str) -> Prediction {
        let now = self.clock.now_millis();
        let window_ms = self.config.window_s * 1_000;
        let thresholds = self.thresholds.read().expect("predictor poisoned").clone();
        let series = self.series.read().expect("predictor poisoned");

        let mut signals = Vec::new();
        let mut max_samples = 0usize;
        let mut threshold_sig = 0.0f64;
        let mut anomaly_sig = 0.0f64;
        let mut trend_sig = 0.0f64;
        let mut forecast_sig = 0.0f64;

        for (key, s) in series.iter() {
            if key.0 != service {
                continue;
            }
            let metric = key.1;
            let points = s.in_window(now, window_ms);
            max_samples = max_samples.max(points.len());
            if points.is_empty() {
                continue;
            }
            let limit = thresholds.get(&metric).copied();

            if let Some(limit) = limit {
                let latest = points[points.len() - 1].value;
                if latest >= limit {
                    threshold_sig = 1.0;
                    signals.push(Signal { metric, kind: SignalKind::Threshold, strength: 1.0 });
                }
            }

            if points.len() >= self.config.min_samples as usize {
                if let Some(z) = z_score(&points) {
                    if z > self.config.anomaly_threshold {
                        let strength = (z / (2.0 * self.config.anomaly_threshold)).min(1.0);
                        anomaly_sig = anomaly_sig.max(strength);
                        signals.push(Signal { metric, kind: SignalKind::Anomaly, strength });
                    }
                }
            }

            if let (Some(limit), Some((slope, intercept))) = (limit, linear_fit(&points)) {
                let horizon = now as f64 + window_ms as f64 / 3.0;
                let projected = slope * horizon + intercept;
                if slope > 0.0 && projected >= limit {
                    trend_sig = trend_sig.max(1.0);
                    signals.push(Signal { metric, kind: SignalKind::Trend, strength: 1.0 });
                }
            }

            if let (Some(limit), Some(projected)) = (limit, moving_average_forecast(&points)) {
                if projected >= limit {
                    forecast_sig = forecast_sig.max(1.0);
                    signals.push(Signal { metric, kind: SignalKind::Forecast, strength: 1.0 });
                }
            }
        }

        if max_samples < self.config.min_samples as usize {
            return Prediction::cold_start();
        }

        let likelihood = (0.4 * threshold_sig
            + 0.3 * anomaly_sig
            + 0.2 * trend_sig
            + 0.1 * forecast_sig)
            .clamp(0.0, 1.0);
        let confidence =
            (max_samples as f64 / self.config.min_samples as f64).min(1.0);

        Prediction { likelihood, confidence, signals }
    }
}

/// z-score of the latest point against the rest of the window.
fn z_score(points: &[SeriesPoint]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let history = &points[..points.len() - 1];
    let n = history.len() as f64;
    let mean = history.iter().map(|p| p.value).sum::<f64>() / n;
    let variance = history.iter().map(|p| (p.value - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    Some((points[points.len() - 1].value - mean) / stddev)
}

/// Least-squares fit `value = slope·t + intercept` over the window.
fn linear_fit(points: &[SeriesPoint]) -> Option<(f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let sum_t: f64 = points.iter().map(|p| p.at_millis as f64).sum();
    let sum_v: f64 = points.iter().map(|p| p.value).sum();
    let sum_tv: f64 = points.iter().map(|p| p.at_millis as f64 * p.value).sum();
    let sum_tt: f64 = points.iter().map(|p| (p.at_millis as f64).powi(2)).sum();
    let denom = n * sum_tt - sum_t * sum_t;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_tv - sum_t * sum_v) / denom;
    let intercept = (sum_v - slope * sum_t) / n;
    Some((slope, intercept))
}

/// Extrapolate one step from the difference of two adjacent moving averages.
fn moving_average_forecast(points: &[SeriesPoint]) -> Option<f64> {
    let m = (points.len() / 4).max(2);
    if points.len() < 2 * m {
        return None;
    }
    let recent: f64 =
        points[points.len() - m..].iter().map(|p| p.value).sum::<f64>() / m as f64;
    let earlier: f64 = points[points.len() - 2 * m..points.len() - m]
        .iter()
        .map(|p| p.value)
        .sum::<f64>()
        / m as f64;
    Some(recent + (recent - earlier))
}
