//! Mesh configuration.
//!
//! `MeshConfig` covers the whole tunable surface: circuit breaking, retry,
//! backoff, rate limiting, discovery, load balancing, health, priorities,
//! timeouts, and prediction. All of it deserializes with serde, numeric
//! fields carry their unit in the name (`_ms`, `_s`), and `validate()`
//! reports every violation at once so a bad deployment fails loudly at
//! `Mesh::new` instead of misbehaving at 3am.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStrategyKind {
    #[default]
    Basic,
    Gradual,
    Dependency,
    RateLimited,
    HealthAware,
    Predictive,
}

/// Backoff strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fibonacci,
    DecorrelatedJitter,
    ResourceSensitive,
    Pattern,
    Adaptive,
}

/// Rate limiter algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    #[default]
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
    Adaptive,
}

/// Discovery backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryBackendKind {
    #[default]
    Registry,
    Dns,
}

/// Load balancer strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    LeastConnections,
    ResponseTimeWeighted,
    Random,
    HealthScoreWeighted,
}

/// Adaptive timeout strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Percentile,
    Adaptive,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub strategy: CircuitStrategyKind,
    /// Rolling window for failure counting.
    pub window_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 5,
            strategy: CircuitStrategyKind::Basic,
            window_ms: 60_000,
        }
    }
}

impl CircuitConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
    /// Total wall-time budget; `None` means attempts alone bound the loop.
    pub budget_ms: Option<u64>,
    /// Per-attempt timeout override; `None` defers to the adaptive timeout.
    pub timeout_per_attempt_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.5,
            budget_ms: None,
            timeout_per_attempt_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffKind,
    /// ε for ε-greedy strategy selection in adaptive mode.
    pub epsilon: f64,
    /// Utilization above this scales resource-sensitive delays.
    pub resource_threshold: f64,
    /// Multiplier `k` in `1 + k·max(0, util − threshold)`.
    pub resource_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::Exponential,
            epsilon: 0.1,
            resource_threshold: 0.7,
            resource_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitKind,
    pub rps: f64,
    pub burst: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub cooldown_s: u64,
    pub scale_factor: f64,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitKind::TokenBucket,
            rps: 100.0,
            burst: 100.0,
            min_rate: 10.0,
            max_rate: 1_000.0,
            cooldown_s: 30,
            scale_factor: 10.0,
            window_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub backend: DiscoveryBackendKind,
    pub registry_url: Option<String>,
    pub dns_suffix: Option<String>,
    pub cache_ttl_s: u64,
    pub health_check_interval_s: u64,
    /// Registry-side deregistration grace after failed TTL checks.
    pub deregister_timeout_s: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: DiscoveryBackendKind::Registry,
            registry_url: None,
            dns_suffix: None,
            cache_ttl_s: 30,
            health_check_interval_s: 10,
            deregister_timeout_s: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }

    pub fn deregister_timeout(&self) -> Duration {
        Duration::from_secs(self.deregister_timeout_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalancerKind,
    pub connection_limit: u32,
    pub drain_timeout_ms: u64,
    pub health_check_interval_s: u64,
    /// Minimum rolling health score an instance needs to be picked.
    pub min_health_score: f64,
    /// Consecutive failures before an instance is marked Failed.
    pub fail_after: u32,
    /// Consecutive successes before a Failed instance is restored.
    pub restore_after: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerKind::RoundRobin,
            connection_limit: 100,
            drain_timeout_ms: 30_000,
            health_check_interval_s: 5,
            min_health_score: 0.5,
            fail_after: 3,
            restore_after: 2,
        }
    }
}

impl BalancerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
    pub connections: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self { cpu: 0.8, memory: 0.8, disk: 0.9, network: 0.8, connections: 0.9 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_s: u64,
    pub response_time_threshold_ms: u64,
    pub error_rate_threshold: f64,
    pub resource_thresholds: ResourceThresholds,
    /// How long a Critical dependency may stay Unhealthy before dependents
    /// cascade from Degraded to Unhealthy.
    pub cascade_delay_s: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_s: 5,
            response_time_threshold_ms: 1_000,
            error_rate_threshold: 0.05,
            resource_thresholds: ResourceThresholds::default(),
            cascade_delay_s: 10,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_s)
    }

    pub fn response_time_threshold(&self) -> Duration {
        Duration::from_millis(self.response_time_threshold_ms)
    }

    pub fn cascade_delay(&self) -> Duration {
        Duration::from_secs(self.cascade_delay_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Total admission slots shared by all priorities.
    pub total_slots: u32,
    pub reserved_critical: u32,
    pub reserved_high: u32,
    pub reserved_normal: u32,
    pub reserved_low: u32,
    pub reserved_bulk: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            total_slots: 256,
            reserved_critical: 8,
            reserved_high: 8,
            reserved_normal: 16,
            reserved_low: 4,
            reserved_bulk: 0,
        }
    }
}

impl PriorityConfig {
    pub fn reserved_total(&self) -> u32 {
        self.reserved_critical
            + self.reserved_high
            + self.reserved_normal
            + self.reserved_low
            + self.reserved_bulk
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub strategy: TimeoutKind,
    pub min_ms: u64,
    pub max_ms: u64,
    pub initial_ms: u64,
    pub percentile: f64,
    pub factor: f64,
    pub min_samples: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            strategy: TimeoutKind::Hybrid,
            min_ms: 50,
            max_ms: 30_000,
            initial_ms: 1_000,
            percentile: 95.0,
            factor: 1.5,
            min_samples: 20,
        }
    }
}

impl TimeoutConfig {
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub window_s: u64,
    pub resolution_s: u64,
    pub min_samples: u32,
    pub anomaly_threshold: f64,
    /// Deny admission when `likelihood · confidence` exceeds this.
    pub deny_product: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window_s: 300,
            resolution_s: 10,
            min_samples: 30,
            anomaly_threshold: 2.0,
            deny_product: 0.8,
        }
    }
}

impl PredictorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_s)
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_secs(self.resolution_s)
    }
}

/// Top-level mesh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Name this process registers under; `MESH_SERVICE_NAME` overrides.
    pub service_name: Option<String>,
    /// Log level hint for the embedder; `MESH_LOG_LEVEL` overrides.
    pub log_level: Option<String>,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub backoff: BackoffConfig,
    pub rate_limit: RateLimitConfig,
    pub discovery: DiscoveryConfig,
    pub lb: BalancerConfig,
    pub health: HealthConfig,
    pub priority: PriorityConfig,
    pub timeout: TimeoutConfig,
    pub predictor: PredictorConfig,
}

impl MeshConfig {
    /// Apply environment overrides: `MESH_REGISTRY_URL`, `MESH_DNS_SUFFIX`,
    /// `MESH_SERVICE_NAME`, `MESH_LOG_LEVEL`.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("MESH_REGISTRY_URL") {
            if !url.is_empty() {
                self.discovery.registry_url = Some(url);
            }
        }
        if let Ok(suffix) = std::env::var("MESH_DNS_SUFFIX") {
            if !suffix.is_empty() {
                self.discovery.dns_suffix = Some(suffix);
            }
        }
        if let Ok(name) = std::env::var("MESH_SERVICE_NAME") {
            if !name.is_empty() {
                self.service_name = Some(name);
            }
        }
        if let Ok(level) = std::env::var("MESH_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = Some(level);
            }
        }
        self
    }

    /// Check every field, collecting all violations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.circuit.failure_threshold == 0 {
            violations.push("circuit.failure_threshold must be > 0".to_string());
        }
        if self.circuit.success_threshold == 0 {
            violations.push("circuit.success_threshold must be > 0".to_string());
        }
        if self.circuit.half_open_max_calls == 0 {
            violations.push("circuit.half_open_max_calls must be > 0".to_string());
        }
        if self.circuit.success_threshold > self.circuit.half_open_max_calls {
            violations.push(format!(
                "circuit.success_threshold ({}) cannot exceed half_open_max_calls ({})",
                self.circuit.success_threshold, self.circuit.half_open_max_calls
            ));
        }
        if self.circuit.window_ms == 0 {
            violations.push("circuit.window_ms must be > 0".to_string());
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            violations.push(format!(
                "retry.max_attempts must be in 1..=10 (got {})",
                self.retry.max_attempts
            ));
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            violations.push("retry.multiplier must be finite and >= 1".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            violations.push("retry.initial_delay_ms cannot exceed retry.max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            violations.push("retry.jitter_factor must be in [0, 1]".to_string());
        }

        if !(0.0..=1.0).contains(&self.backoff.epsilon) {
            violations.push("backoff.epsilon must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.backoff.resource_threshold) {
            violations.push("backoff.resource_threshold must be in [0, 1]".to_string());
        }
        if self.backoff.resource_factor < 0.0 || !self.backoff.resource_factor.is_finite() {
            violations.push("backoff.resource_factor must be finite and >= 0".to_string());
        }

        if self.rate_limit.rps <= 0.0 || !self.rate_limit.rps.is_finite() {
            violations.push("rate_limit.rps must be finite and > 0".to_string());
        }
        if self.rate_limit.burst < 0.0 || !self.rate_limit.burst.is_finite() {
            violations.push("rate_limit.burst must be finite and >= 0".to_string());
        }
        if self.rate_limit.min_rate > self.rate_limit.max_rate {
            violations.push("rate_limit.min_rate cannot exceed rate_limit.max_rate".to_string());
        }
        if self.rate_limit.scale_factor <= 0.0 || !self.rate_limit.scale_factor.is_finite() {
            violations.push("rate_limit.scale_factor must be finite and > 0".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            violations.push("rate_limit.window_ms must be > 0".to_string());
        }

        if self.discovery.backend == DiscoveryBackendKind::Dns
            && self.discovery.dns_suffix.is_none()
        {
            violations.push("discovery.dns_suffix is required for the dns backend".to_string());
        }
        if self.discovery.cache_ttl_s == 0 {
            violations.push("discovery.cache_ttl_s must be > 0".to_string());
        }

        if self.lb.connection_limit == 0 {
            violations.push("lb.connection_limit must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.lb.min_health_score) {
            violations.push("lb.min_health_score must be in [0, 1]".to_string());
        }
        if self.lb.fail_after == 0 || self.lb.restore_after == 0 {
            violations.push("lb.fail_after and lb.restore_after must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.health.error_rate_threshold) {
            violations.push("health.error_rate_threshold must be in [0, 1]".to_string());
        }
        for (name, value) in [
            ("cpu", self.health.resource_thresholds.cpu),
            ("memory", self.health.resource_thresholds.memory),
            ("disk", self.health.resource_thresholds.disk),
            ("network", self.health.resource_thresholds.network),
            ("connections", self.health.resource_thresholds.connections),
        ] {
            if !(0.0..=1.0).contains(&value) {
                violations
                    .push(format!("health.resource_thresholds.{} must be in [0, 1]", name));
            }
        }

        if self.priority.total_slots == 0 {
            violations.push("priority.total_slots must be > 0".to_string());
        }
        if self.priority.reserved_total() > self.priority.total_slots {
            violations.push(format!(
                "priority reserved slots ({}) exceed total_slots ({})",
                self.priority.reserved_total(),
                self.priority.total_slots
            ));
        }

        if self.timeout.min_ms == 0 || self.timeout.min_ms > self.timeout.max_ms {
            violations.push("timeout.min_ms must be > 0 and <= timeout.max_ms".to_string());
        }
        if !(self.timeout.min_ms..=self.timeout.max_ms).contains(&self.timeout.initial_ms) {
            violations.push("timeout.initial_ms must lie within [min_ms, max_ms]".to_string());
        }
        if !(0.0 < self.timeout.percentile && self.timeout.percentile < 100.0) {
            violations.push("timeout.percentile must be in (0, 100)".to_string());
        }
        if self.timeout.factor <= 0.0 || !self.timeout.factor.is_finite() {
            violations.push("timeout.factor must be finite and > 0".to_string());
        }

        if self.predictor.resolution_s == 0 || self.predictor.window_s < self.predictor.resolution_s
        {
            violations.push(
                "predictor.window_s must be >= predictor.resolution_s and resolution > 0"
                    .to_string(),
            );
        }
        if self.predictor.min_samples == 0 {
            violations.push("predictor.min_samples must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.predictor.deny_product) {
            violations.push("predictor.deny_product must be in [0, 1]".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Violations { violations })
        }
    }
}
