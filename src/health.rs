//! Per-service health tracking.
//!
//! The monitor aggregates resource utilization, response times, error rates,
//! and dependency health into one [`HealthStatus`] per service:
//!
//! - any resource ≥ threshold+0.1, error rate above the limit, or response
//!   time above the limit → `Unhealthy`
//! - any resource ≥ threshold, or an Unhealthy Critical dependency → `Degraded`
//! - everything green and all critical dependencies healthy → `Healthy`
//! - no samples for more than 2× the check interval → `Unknown`
//!
//! Transitions are edge-triggered: each change is emitted once through the
//! metrics sink, tracing, a `watch` channel, and dependency propagation.

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::dependency::{DependencyChain, DependencyKind};
use crate::metrics::MetricsSink;
use crate::window::RollingWindow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Service health, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Severity for "at least as bad as" comparisons; Unknown ranks lowest.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Unhealthy => 3,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked resource dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Connections,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Connections => "connections",
        }
    }
}

/// Latest reading for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceMetrics {
    pub util: f64,
    pub threshold: f64,
    /// Utilization change per second, from the last two samples.
    pub trend_slope: f64,
    pub last_update_ms: u64,
}

/// Aggregated view handed to callers.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub response_time: Option<Duration>,
    pub error_rate: f64,
    pub dependency_health: Vec<(String, DependencyKind, HealthStatus)>,
}

struct ServiceState {
    resources: HashMap<ResourceKind, ResourceMetrics>,
    window: RollingWindow,
    last_seen_ms: u64,
    status: HealthStatus,
    tx: watch::Sender<HealthStatus>,
}

/// Monitors per-service resource and request health.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    deps: Arc<DependencyChain>,
    services: RwLock<HashMap<String, Arc<Mutex<ServiceState>>>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
        deps: Arc<DependencyChain>,
    ) -> Self {
        Self { config, clock, sink, deps, services: RwLock::new(HashMap::new()) }
    }

    fn state_for(&self, service: &str) -> Arc<Mutex<ServiceState>> {
        if let Some(state) = self.services.read().expect("HealthMonitor poisoned").get(service) {
            return state.clone();
        }
        let mut services = self.services.write().expect("HealthMonitor poisoned");
        services
            .entry(service.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(HealthStatus::Unknown);
                Arc::new(Mutex::new(ServiceState {
                    resources: HashMap::new(),
                    window: RollingWindow::with_defaults(self.clock.clone()),
                    last_seen_ms: self.clock.now_millis(),
                    status: HealthStatus::Unknown,
                    tx,
                }))
            })
            .clone()
    }

    /// Record a resource utilization sample in `[0, 1]`.
    pub fn record_resource(&self, service: &str, kind: ResourceKind, util: f64) {
        if !util.is_finite() {
            return;
        }
        let util = util.clamp(0.0, 1.0);
        let now = self.clock.now_millis();
        let threshold = self.threshold_for(kind);
        let state = self.state_for(service);
        let mut state = state.lock().expect("service state poisoned");
        let slope = match state.resources.get(&kind) {
            Some(prev) if now > prev.last_update_ms => {
                (util - prev.util) / ((now - prev.last_update_ms) as f64 / 1_000.0)
            }
            _ => 0.0,
        };
        state
            .resources
            .insert(kind, ResourceMetrics { util, threshold, trend_slope: slope, last_update_ms: now });
        state.last_seen_ms = now;
        drop(state);
        self.sink.gauge("mesh_resource_util", &[("service", service), ("resource", kind.as_str())], util);
    }

    /// Record a request outcome for error-rate and response-time tracking.
    pub fn record_outcome(&self, service: &str, latency: Duration, success: bool) {
        let state = self.state_for(service);
        let mut state = state.lock().expect("service state poisoned");
        state.window.record_outcome(latency, success);
        state.last_seen_ms = self.clock.now_millis();
    }

    fn threshold_for(&self, kind: ResourceKind) -> f64 {
        let t = &self.config.resource_thresholds;
        match kind {
            ResourceKind::Cpu => t.cpu,
            ResourceKind::Memory => t.memory,
            ResourceKind::Disk => t.disk,
            ResourceKind::Network => t.network,
            ResourceKind::Connections => t.connections,
        }
    }

    /// Evaluate the decision rules and publish any transition.
    pub fn check(&self, service: &str) -> ServiceHealth {
        let now = self.clock.now_millis();
        let dependency_health = self.deps.dependencies_of(service);
        let state = self.state_for(service);
        let mut state = state.lock().expect("service state poisoned");

        let totals = state.window.totals();
        let error_rate = totals.error_rate();
        let response_time = totals.mean_latency();
        let stale_after = 2 * self.config.check_interval().as_millis() as u64;
        let has_samples = totals.requests > 0 || !state.resources.is_empty();

        let status = if !has_samples || now.saturating_sub(state.last_seen_ms) > stale_after {
            HealthStatus::Unknown
        } else {
            let hot = state.resources.values().any(|r| r.util >= r.threshold + 0.1);
            let warm = state.resources.values().any(|r| r.util >= r.threshold);
            let slow = response_time
                .is_some_and(|rt| rt > self.config.response_time_threshold());
            let erroring = error_rate > self.config.error_rate_threshold;
            let critical_down = dependency_health.iter().any(|(_, kind, status)| {
                *kind == DependencyKind::Critical && *status == HealthStatus::Unhealthy
            });

            if hot || erroring || slow {
                HealthStatus::Unhealthy
            } else if warm || critical_down {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        };

        if status != state.status {
            tracing::info!(service, from = %state.status, to = %status, "health transition");
            self.sink.event(
                "health_transition",
                &[("service", service), ("from", state.status.as_str()), ("to", status.as_str())],
            );
            state.status = status;
            let _ = state.tx.send(status);
            drop(state);
            self.deps.propagate(service, status);
        }

        ServiceHealth { status, response_time, error_rate, dependency_health }
    }

    /// Current status without recomputation side effects beyond evaluation.
    pub fn status(&self, service: &str) -> HealthStatus {
        self.check(service).status
    }

    /// Subscribe to status transitions for `service`.
    pub fn subscribe(&self, service: &str) -> watch::Receiver<HealthStatus> {
        let state = self.state_for(service);
        let state = state.lock().expect("service state poisoned");
        state.tx.subscribe()
    }

    /// Latest resource reading, if any.
    pub fn resource(&self, service: &str, kind: ResourceKind) -> Option<ResourceMetrics> {
        let state = self.state_for(service);
        let state = state.lock().expect("service state poisoned");
        state.resources.get(&kind).copied()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::MemorySink;

    fn monitor() -> (HealthMonitor, ManualClock, Arc<DependencyChain>) {
        let clock = ManualClock::new();
        let deps = Arc::new(DependencyChain::new(
            Arc::new(clock.clone()),
            Duration::from_secs(10),
        ));
        let monitor = HealthMonitor::new(
            HealthConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(MemorySink::new()),
            deps.clone(),
        );
        (monitor, clock, deps)
    }

    #[test]
    fn starts_unknown_then_healthy_on_first_passing_check() {
        let (monitor, _clock, _deps) = monitor();
        assert_eq!(monitor.status("svc"), HealthStatus::Unknown);

        monitor.record_outcome("svc", Duration::from_millis(20), true);
        assert_eq!(monitor.status("svc"), HealthStatus::Healthy);
    }

    #[test]
    fn hot_resource_is_unhealthy_warm_is_degraded() {
        let (monitor, _clock, _deps) = monitor();
        monitor.record_resource("svc", ResourceKind::Cpu, 0.85);
        assert_eq!(monitor.status("svc"), HealthStatus::Degraded);

        monitor.record_resource("svc", ResourceKind::Cpu, 0.95);
        assert_eq!(monitor.status("svc"), HealthStatus::Unhealthy);
    }

    #[test]
    fn error_rate_above_threshold_is_unhealthy() {
        let (monitor, _clock, _deps) = monitor();
        for i in 0..100 {
            monitor.record_outcome("svc", Duration::from_millis(10), i % 10 != 0);
        }
        // 10% errors > 5% threshold
        assert_eq!(monitor.status("svc"), HealthStatus::Unhealthy);
    }

    #[test]
    fn slow_responses_are_unhealthy() {
        let (monitor, _clock, _deps) = monitor();
        for _ in 0..10 {
            monitor.record_outcome("svc", Duration::from_millis(3_000), true);
        }
        assert_eq!(monitor.status("svc"), HealthStatus::Unhealthy);
    }

    #[test]
    fn missing_samples_go_unknown_after_two_intervals() {
        let (monitor, clock, _deps) = monitor();
        monitor.record_outcome("svc", Duration::from_millis(10), true);
        assert_eq!(monitor.status("svc"), HealthStatus::Healthy);

        clock.advance(11_000); // > 2 × 5 s
        assert_eq!(monitor.status("svc"), HealthStatus::Unknown);
    }

    #[test]
    fn unhealthy_critical_dependency_degrades_the_service() {
        let (monitor, _clock, deps) = monitor();
        deps.add("svc", "ledger", DependencyKind::Critical, 1.0);
        deps.set_status("ledger", HealthStatus::Unhealthy);

        monitor.record_outcome("svc", Duration::from_millis(10), true);
        assert_eq!(monitor.status("svc"), HealthStatus::Degraded);
    }

    #[test]
    fn transitions_are_edge_triggered_on_the_watch_channel() {
        let (monitor, _clock, _deps) = monitor();
        let rx = monitor.subscribe("svc");
        assert_eq!(*rx.borrow(), HealthStatus::Unknown);

        monitor.record_outcome("svc", Duration::from_millis(10), true);
        monitor.status("svc");
        assert_eq!(*rx.borrow(), HealthStatus::Healthy);

        // Re-evaluating without change must not re-send.
        let mut rx2 = monitor.subscribe("svc");
        rx2.borrow_and_update();
        monitor.status("svc");
        assert!(!rx2.has_changed().unwrap());
    }

    #[test]
    fn trend_slope_reflects_utilization_change() {
        let (monitor, clock, _deps) = monitor();
        monitor.record_resource("svc", ResourceKind::Memory, 0.2);
        clock.advance(1_000);
        monitor.record_resource("svc", ResourceKind::Memory, 0.4);
        let metrics = monitor.resource("svc", ResourceKind::Memory).unwrap();
        assert!((metrics.trend_slope - 0.2).abs() < 1e-9);
    }
}
