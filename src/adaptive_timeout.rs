//! Per-service adaptive timeouts from observed latency distributions.
//!
//! Three strategies: `percentile` (histogram quantile times an adjustment
//! factor), `adaptive` (EWMA times the factor), and `hybrid` (max of both).
//! Until `min_samples` observations arrive the configured initial timeout is
//! returned. A success rate below 0.9 biases the timeout upward by 1.25× per
//! 0.1 of gap, and the result is always clamped to `[min, max]`.

use crate::config::{TimeoutConfig, TimeoutKind};
use hdrhistogram::Histogram;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// EWMA smoothing factor: weight of the newest sample.
const EWMA_ALPHA: f64 = 0.2;
/// Outcomes kept for the success-rate bias.
const RECENT_OUTCOMES: usize = 100;

#[derive(Debug)]
struct ServiceTimings {
    histogram: Histogram<u64>,
    ewma_ms: f64,
    samples: u64,
    recent: VecDeque<bool>,
}

impl ServiceTimings {
    fn new() -> Self {
        let mut histogram = Histogram::new(2).unwrap_or_else(|_| {
            Histogram::new_with_bounds(1, 3_600_000, 2).expect("static histogram bounds")
        });
        histogram.auto(true);
        Self { histogram, ewma_ms: 0.0, samples: 0, recent: VecDeque::new() }
    }

    fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        self.recent.iter().filter(|&&ok| ok).count() as f64 / self.recent.len() as f64
    }
}

/// Tracks response times per service and derives per-attempt timeouts.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    config: TimeoutConfig,
    state: RwLock<HashMap<String, ServiceTimings>>,
}

impl AdaptiveTimeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config, state: RwLock::new(HashMap::new()) }
    }

    /// Record an observed attempt.
    pub fn observe(&self, service: &str, latency: Duration, success: bool) {
        let mut state = self.state.write().expect("AdaptiveTimeout poisoned");
        let timings = state.entry(service.to_string()).or_insert_with(ServiceTimings::new);
        let ms = latency.as_millis().max(1) as u64;
        timings.histogram.saturating_record(ms);
        timings.ewma_ms = if timings.samples == 0 {
            ms as f64
        } else {
            EWMA_ALPHA * ms as f64 + (1.0 - EWMA_ALPHA) * timings.ewma_ms
        };
        timings.samples += 1;
        if timings.recent.len() >= RECENT_OUTCOMES {
            timings.recent.pop_front();
        }
        timings.recent.push_back(success);
    }

    /// Current timeout for `service`.
    pub fn get(&self, service: &str) -> Duration {
        let state = self.state.read().expect("AdaptiveTimeout poisoned");
        let timings = match state.get(service) {
            Some(t) if t.samples >= self.config.min_samples as u64 => t,
            _ => return self.config.initial().clamp(self.config.min(), self.config.max()),
        };

        let quantile = self.config.percentile / 100.0;
        let percentile_ms =
            timings.histogram.value_at_quantile(quantile) as f64 * self.config.factor;
        let ewma_ms = timings.ewma_ms * self.config.factor;

        let mut timeout_ms = match self.config.strategy {
            TimeoutKind::Percentile => percentile_ms,
            TimeoutKind::Adaptive => ewma_ms,
            TimeoutKind::Hybrid => percentile_ms.max(ewma_ms),
        };

        let rate = timings.success_rate();
        if rate < 0.9 {
            timeout_ms *= 1.25f64.powf((0.9 - rate) / 0.1);
        }

        Duration::from_millis(timeout_ms as u64).clamp(self.config.min(), self.config.max())
    }

    /// Observed sample count for a service.
    pub fn samples(&self, service: &str) -> u64 {
        self.state
            .read()
            .expect("AdaptiveTimeout poisoned")
            .get(service)
            .map(|t| t.samples)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: TimeoutKind) -> TimeoutConfig {
        TimeoutConfig { strategy, ..TimeoutConfig::default() }
    }

    #[test]
    fn returns_initial_below_min_samples() {
        let timeout = AdaptiveTimeout::new(config(TimeoutKind::Percentile));
        for _ in 0..10 {
            timeout.observe("svc", Duration::from_millis(50), true);
        }
        assert_eq!(timeout.get("svc"), Duration::from_millis(1_000));
        assert_eq!(timeout.get("unknown"), Duration::from_millis(1_000));
    }

    #[test]
    fn percentile_tracks_the_distribution() {
        let timeout = AdaptiveTimeout::new(config(TimeoutKind::Percentile));
        for _ in 0..100 {
            timeout.observe("svc", Duration::from_millis(100), true);
        }
        // p95 = 100 ms, factor 1.5 → 150 ms.
        let got = timeout.get("svc");
        assert!(got >= Duration::from_millis(140) && got <= Duration::from_millis(160), "{:?}", got);
    }

    #[test]
    fn hybrid_takes_the_larger_estimate() {
        let timeout = AdaptiveTimeout::new(config(TimeoutKind::Hybrid));
        // Mostly fast with a slow tail: percentile should dominate the EWMA.
        for i in 0..100 {
            let ms = if i % 10 == 9 { 500 } else { 20 };
            timeout.observe("svc", Duration::from_millis(ms), true);
        }
        let hybrid = timeout.get("svc");

        let ewma_only = AdaptiveTimeout::new(config(TimeoutKind::Adaptive));
        for i in 0..100 {
            let ms = if i % 10 == 9 { 500 } else { 20 };
            ewma_only.observe("svc", Duration::from_millis(ms), true);
        }
        assert!(hybrid >= ewma_only.get("svc"));
    }

    #[test]
    fn low_success_rate_biases_upward() {
        let healthy = AdaptiveTimeout::new(config(TimeoutKind::Percentile));
        let struggling = AdaptiveTimeout::new(config(TimeoutKind::Percentile));
        for i in 0..100 {
            healthy.observe("svc", Duration::from_millis(100), true);
            struggling.observe("svc", Duration::from_millis(100), i % 2 == 0);
        }
        assert!(struggling.get("svc") > healthy.get("svc"));
    }

    #[test]
    fn result_is_clamped_to_bounds() {
        let mut cfg = config(TimeoutKind::Percentile);
        cfg.max_ms = 200;
        let timeout = AdaptiveTimeout::new(cfg);
        for _ in 0..50 {
            timeout.observe("svc", Duration::from_millis(5_000), false);
        }
        assert_eq!(timeout.get("svc"), Duration::from_millis(200));

        let mut cfg = config(TimeoutKind::Percentile);
        cfg.min_ms = 80;
        let timeout = AdaptiveTimeout::new(cfg);
        for _ in 0..50 {
            timeout.observe("svc", Duration::from_millis(1), true);
        }
        assert_eq!(timeout.get("svc"), Duration::from_millis(80));
    }

    #[test]
    fn services_are_tracked_independently() {
        let timeout = AdaptiveTimeout::new(config(TimeoutKind::Percentile));
        for _ in 0..50 {
            timeout.observe("fast", Duration::from_millis(10), true);
            timeout.observe("slow", Duration::from_millis(800), true);
        }
        assert!(timeout.get("slow") > timeout.get("fast"));
    }
}
