//! Fixed-resolution metric buckets and rolling windows.
//!
//! Each bucket covers one resolution slice (1 s default) and holds request,
//! error, trip, and recovery counts plus a latency histogram and resource
//! samples. A [`RollingWindow`] keeps a bounded ring of buckets; rotation is
//! serialized behind a mutex and readers get copies, never references into
//! the ring.
//!
//! Invariant: the sum of bucket counts always equals the window totals,
//! because totals are computed by summing live buckets under the same lock
//! that rotates them.

use crate::clock::Clock;
use hdrhistogram::Histogram;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default bucket resolution.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(1);
/// Default rolling window span.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default span for trend analysis windows.
pub const TREND_WINDOW: Duration = Duration::from_secs(300);

/// Point-in-time resource utilization, each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug)]
struct Bucket {
    start_millis: u64,
    requests: u64,
    errors: u64,
    trips: u64,
    recoveries: u64,
    latency: Histogram<u64>,
    cpu_sum: f64,
    memory_sum: f64,
    resource_samples: u64,
}

impl Bucket {
    fn new(start_millis: u64) -> Self {
        Self {
            start_millis,
            requests: 0,
            errors: 0,
            trips: 0,
            recoveries: 0,
            latency: new_latency_histogram(),
            cpu_sum: 0.0,
            memory_sum: 0.0,
            resource_samples: 0,
        }
    }
}

fn new_latency_histogram() -> Histogram<u64> {
    // 2 significant figures, auto-resizing; saturating_record never fails.
    let mut h = Histogram::new(2).unwrap_or_else(|_| {
        Histogram::new_with_bounds(1, 3_600_000, 2).expect("static histogram bounds")
    });
    h.auto(true);
    h
}

/// Copy-out view of a single bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub start_millis: u64,
    pub requests: u64,
    pub errors: u64,
    pub trips: u64,
    pub recoveries: u64,
    pub latency_count: u64,
    pub mean_latency_ms: f64,
}

/// Aggregated view over every live bucket.
#[derive(Debug)]
pub struct WindowTotals {
    pub requests: u64,
    pub errors: u64,
    pub trips: u64,
    pub recoveries: u64,
    latency: Histogram<u64>,
    cpu_sum: f64,
    memory_sum: f64,
    resource_samples: u64,
}

impl WindowTotals {
    /// Errors divided by requests; 0 when the window is empty.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    /// Latency at `quantile` in `(0, 1]`. `None` when no samples recorded.
    pub fn latency_at(&self, quantile: f64) -> Option<Duration> {
        if self.latency.is_empty() {
            None
        } else {
            Some(Duration::from_millis(self.latency.value_at_quantile(quantile)))
        }
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        if self.latency.is_empty() {
            None
        } else {
            Some(Duration::from_micros((self.latency.mean() * 1_000.0) as u64))
        }
    }

    pub fn latency_samples(&self) -> u64 {
        self.latency.len()
    }

    /// Mean CPU utilization over recorded resource samples.
    pub fn cpu_avg(&self) -> Option<f64> {
        if self.resource_samples == 0 {
            None
        } else {
            Some(self.cpu_sum / self.resource_samples as f64)
        }
    }

    pub fn memory_avg(&self) -> Option<f64> {
        if self.resource_samples == 0 {
            None
        } else {
            Some(self.memory_sum / self.resource_samples as f64)
        }
    }
}

/// Ring of metric buckets over a sliding time window.
#[derive(Debug)]
pub struct RollingWindow {
    resolution_ms: u64,
    capacity: usize,
    clock: Arc<dyn Clock>,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RollingWindow {
    pub fn new(window: Duration, resolution: Duration, clock: Arc<dyn Clock>) -> Self {
        let resolution_ms = resolution.as_millis().max(1) as u64;
        let capacity = (window.as_millis() as u64 / resolution_ms).max(1) as usize;
        Self { resolution_ms, capacity, clock, buckets: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_RESOLUTION, clock)
    }

    fn bucket_start(&self, now: u64) -> u64 {
        now - now % self.resolution_ms
    }

    /// Drop expired buckets and make sure the current bucket exists.
    /// Callers must hold the ring lock.
    fn rotate<'a>(&self, buckets: &'a mut VecDeque<Bucket>) -> &'a mut Bucket {
        let now = self.clock.now_millis();
        let current_start = self.bucket_start(now);
        let window_ms = self.resolution_ms * self.capacity as u64;
        let oldest_allowed = current_start.saturating_sub(window_ms.saturating_sub(self.resolution_ms));

        while buckets.front().is_some_and(|b| b.start_millis < oldest_allowed) {
            buckets.pop_front();
        }
        if buckets.back().map(|b| b.start_millis) != Some(current_start) {
            buckets.push_back(Bucket::new(current_start));
            while buckets.len() > self.capacity {
                buckets.pop_front();
            }
        }
        buckets.back_mut().expect("bucket just pushed")
    }

    pub fn record_outcome(&self, latency: Duration, success: bool) {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        let bucket = self.rotate(&mut guard);
        bucket.requests += 1;
        if !success {
            bucket.errors += 1;
        }
        bucket.latency.saturating_record(latency.as_millis().max(1) as u64);
    }

    pub fn record_trip(&self) {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        self.rotate(&mut guard).trips += 1;
    }

    pub fn record_recovery(&self) {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        self.rotate(&mut guard).recoveries += 1;
    }

    pub fn record_resource(&self, sample: ResourceSample) {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        let bucket = self.rotate(&mut guard);
        bucket.cpu_sum += sample.cpu;
        bucket.memory_sum += sample.memory;
        bucket.resource_samples += 1;
    }

    /// Aggregate every live bucket. Expired buckets are rotated out first, so
    /// totals never include stale data.
    pub fn totals(&self) -> WindowTotals {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        self.rotate(&mut guard);
        let mut totals = WindowTotals {
            requests: 0,
            errors: 0,
            trips: 0,
            recoveries: 0,
            latency: new_latency_histogram(),
            cpu_sum: 0.0,
            memory_sum: 0.0,
            resource_samples: 0,
        };
        for bucket in guard.iter() {
            totals.requests += bucket.requests;
            totals.errors += bucket.errors;
            totals.trips += bucket.trips;
            totals.recoveries += bucket.recoveries;
            let _ = totals.latency.add(&bucket.latency);
            totals.cpu_sum += bucket.cpu_sum;
            totals.memory_sum += bucket.memory_sum;
            totals.resource_samples += bucket.resource_samples;
        }
        totals
    }

    /// Copy-out snapshot of the live buckets, oldest first.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let mut guard = self.buckets.lock().expect("RollingWindow poisoned");
        self.rotate(&mut guard);
        guard
            .iter()
            .map(|b| BucketSnapshot {
                start_millis: b.start_millis,
                requests: b.requests,
                errors: b.errors,
                trips: b.trips,
                recoveries: b.recoveries,
                latency_count: b.latency.len(),
                mean_latency_ms: if b.latency.is_empty() { 0.0 } else { b.latency.mean() },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn window_with_clock() -> (RollingWindow, ManualClock) {
        let clock = ManualClock::new();
        let window =
            RollingWindow::new(Duration::from_secs(60), Duration::from_secs(1), Arc::new(clock.clone()));
        (window, clock)
    }

    #[test]
    fn bucket_sums_match_window_totals() {
        let (window, clock) = window_with_clock();

        for i in 0..10 {
            window.record_outcome(Duration::from_millis(10 + i), i % 3 == 0);
            clock.advance(500);
        }

        let totals = window.totals();
        let snapshot = window.snapshot();
        let bucket_requests: u64 = snapshot.iter().map(|b| b.requests).sum();
        let bucket_errors: u64 = snapshot.iter().map(|b| b.errors).sum();
        assert_eq!(totals.requests, 10);
        assert_eq!(bucket_requests, totals.requests);
        assert_eq!(bucket_errors, totals.errors);
    }

    #[test]
    fn expired_buckets_are_dropped() {
        let (window, clock) = window_with_clock();

        window.record_outcome(Duration::from_millis(5), true);
        clock.advance(61_000);
        window.record_outcome(Duration::from_millis(5), false);

        let totals = window.totals();
        assert_eq!(totals.requests, 1, "sample outside the window must not survive");
        assert_eq!(totals.errors, 1);
    }

    #[test]
    fn error_rate_is_errors_over_requests() {
        let (window, _clock) = window_with_clock();
        for i in 0..10 {
            window.record_outcome(Duration::from_millis(1), i >= 2);
        }
        let totals = window.totals();
        assert!((totals.error_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn empty_window_has_no_latency() {
        let (window, _clock) = window_with_clock();
        let totals = window.totals();
        assert_eq!(totals.requests, 0);
        assert_eq!(totals.error_rate(), 0.0);
        assert!(totals.latency_at(0.95).is_none());
    }

    #[test]
    fn latency_percentiles_reflect_samples() {
        let (window, _clock) = window_with_clock();
        for ms in [10u64, 20, 30, 40, 1000] {
            window.record_outcome(Duration::from_millis(ms), true);
        }
        let p95 = window.totals().latency_at(0.95).unwrap();
        assert!(p95 >= Duration::from_millis(40), "p95 was {:?}", p95);
    }

    #[test]
    fn trips_and_recoveries_accumulate() {
        let (window, clock) = window_with_clock();
        window.record_trip();
        clock.advance(2_000);
        window.record_trip();
        window.record_recovery();
        let totals = window.totals();
        assert_eq!(totals.trips, 2);
        assert_eq!(totals.recoveries, 1);
    }

    #[test]
    fn resource_samples_average() {
        let (window, _clock) = window_with_clock();
        window.record_resource(ResourceSample { cpu: 0.2, memory: 0.4 });
        window.record_resource(ResourceSample { cpu: 0.6, memory: 0.8 });
        let totals = window.totals();
        assert!((totals.cpu_avg().unwrap() - 0.4).abs() < 1e-9);
        assert!((totals.memory_avg().unwrap() - 0.6).abs() < 1e-9);
    }
}
