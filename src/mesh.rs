//! The mesh handle: one value owning every reliability component.
//!
//! `Mesh::builder(config, transport)` wires the rate limiter, circuit
//! breakers, discovery, load balancer, adaptive timeouts, predictor, health
//! monitor, and dependency chain behind a single entry point:
//!
//! ```text
//! call → RateLimiter → CircuitBreaker.admit → Discovery → retry loop {
//!     LoadBalancer.lease → AdaptiveTimeout.wrap → Transport.invoke →
//!     record(CB, LB, timeout, predictor, health, metrics)
//! }
//! ```
//!
//! There are no hidden singletons: dropping the mesh (after `close`) tears
//! every loop down. All state is process-local.

use crate::adaptive_timeout::AdaptiveTimeout;
use crate::balancer::LoadBalancer;
use crate::cancel::CancellationToken;
use crate::circuit::priority::{Priority, PrioritySlots};
use crate::circuit::registry::BreakerRegistry;
use crate::circuit::strategy::BreakerStrategy;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{CircuitStrategyKind, DiscoveryBackendKind, MeshConfig};
use crate::dependency::{DependencyChain, DependencyKind};
use crate::discovery::{
    Discovery, DnsBackend, Instance, RegistryBackend, RegistryError, StaticSrvResolver, WatchHandle,
};
use crate::error::{CallFailure, ConfigError, MeshError};
use crate::health::{HealthMonitor, HealthStatus, ResourceKind};
use crate::metrics::{MetricsSink, NullSink};
use crate::predictor::{FailurePredictor, MetricKind};
use crate::rate_limit::{Decision, RateLimiter};
use crate::retry::{Fingerprint, RetryPolicy, RetrySession};
use crate::window::RollingWindow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stable window for gradual-recovery rate doubling.
const GRADUAL_STABLE_WINDOW: Duration = Duration::from_secs(30);

/// Host-supplied transport. The mesh moves opaque payloads; it never
/// interprets them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn invoke(
        &self,
        instance: &Instance,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Active health probe used by the background check loop. The default
    /// reports healthy, leaving instance state to passive outcome tracking.
    async fn check_health(&self, instance: &Instance) -> bool {
        let _ = instance;
        true
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub priority: Priority,
    /// Correlates the retry session; generated when absent.
    pub trace_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    /// Set to `false` to bypass the discovery cache for this call.
    pub skip_discovery_cache: bool,
}

impl CallOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Builder for [`Mesh`].
pub struct MeshBuilder<T: Transport> {
    config: MeshConfig,
    transport: Arc<T>,
    backend: Option<Arc<dyn RegistryBackend>>,
    sink: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<T: Transport> MeshBuilder<T> {
    /// Override the registry backend (a Consul client, etcd shim, test
    /// registry). Without this, `discovery.backend` picks the default.
    pub fn backend(mut self, backend: Arc<dyn RegistryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Mesh<T>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));

        let backend: Arc<dyn RegistryBackend> = match self.backend {
            Some(backend) => backend,
            None => match config.discovery.backend {
                DiscoveryBackendKind::Registry => {
                    Arc::new(crate::discovery::InMemoryRegistry::new())
                }
                DiscoveryBackendKind::Dns => {
                    let suffix = config
                        .discovery
                        .dns_suffix
                        .clone()
                        .unwrap_or_else(|| "local".to_string());
                    Arc::new(DnsBackend::new(Box::new(StaticSrvResolver::new()), suffix))
                }
            },
        };

        let deps = Arc::new(DependencyChain::new(clock.clone(), config.health.cascade_delay()));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            clock.clone(),
            sink.clone(),
            deps.clone(),
        ));
        let predictor =
            Arc::new(FailurePredictor::new(config.predictor.clone(), clock.clone()));
        let discovery = Arc::new(Discovery::new(
            backend,
            config.discovery.clone(),
            clock.clone(),
            sink.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(config.lb.clone(), sink.clone()));
        let rate_limiter =
            Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let timeouts = Arc::new(AdaptiveTimeout::new(config.timeout.clone()));
        let slots = Arc::new(PrioritySlots::new(config.priority.clone()));
        let retry = RetryPolicy::from_config(&config.retry, &config.backoff)?;

        let mesh = Mesh {
            inner: Arc::new(MeshInner {
                config,
                transport: self.transport,
                clock,
                sink,
                discovery,
                balancer,
                rate_limiter,
                predictor,
                health,
                deps,
                timeouts,
                slots,
                retry,
                breakers: Mutex::new(HashMap::new()),
                breaker_registry: BreakerRegistry::new(),
                windows: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        mesh.spawn_background();
        Ok(mesh)
    }
}

struct MeshInner<T: Transport> {
    config: MeshConfig,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    discovery: Arc<Discovery>,
    balancer: Arc<LoadBalancer>,
    rate_limiter: Arc<RateLimiter>,
    predictor: Arc<FailurePredictor>,
    health: Arc<HealthMonitor>,
    deps: Arc<DependencyChain>,
    timeouts: Arc<AdaptiveTimeout>,
    slots: Arc<PrioritySlots>,
    retry: RetryPolicy,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_registry: BreakerRegistry,
    windows: Mutex<HashMap<String, Arc<RollingWindow>>>,
    /// service-id → service name, for `deregister(service_id)`.
    registrations: Mutex<HashMap<String, String>>,
    background: Mutex<Vec<tokio::task::AbortHandle>>,
    closed: AtomicBool,
}

/// Owning handle over the whole reliability stack. Cheap to clone.
pub struct Mesh<T: Transport> {
    inner: Arc<MeshInner<T>>,
}

impl<T: Transport> Clone for Mesh<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Transport> Mesh<T> {
    pub fn builder(config: MeshConfig, transport: T) -> MeshBuilder<T> {
        MeshBuilder {
            config,
            transport: Arc::new(transport),
            backend: None,
            sink: None,
            clock: None,
        }
    }

    /// Build with defaults from config alone.
    pub fn new(config: MeshConfig, transport: T) -> Result<Self, ConfigError> {
        Self::builder(config, transport).build()
    }

    fn spawn_background(&self) {
        // Health evaluation and cascade rechecks need a runtime; skip
        // silently when built outside one (unit tests drive checks by hand).
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.inner.clone();
        let interval = inner.config.health.check_interval();
        let health_task = handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                inner.deps.recheck_cascades();
                let services: Vec<String> = {
                    let breakers = inner.breakers.lock().expect("Mesh breakers poisoned");
                    breakers.keys().cloned().collect()
                };
                for service in services {
                    inner.health.check(&service);
                }
            }
        });

        // Instance check loop: probe every discoverable instance and feed
        // the balancer's Failed/restore tracking.
        let inner = self.inner.clone();
        let interval = inner.config.lb.health_check_interval();
        let check_task = handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let services: Vec<String> = {
                    let breakers = inner.breakers.lock().expect("Mesh breakers poisoned");
                    breakers.keys().cloned().collect()
                };
                for service in services {
                    let Ok(instances) = inner.discovery.discover(&service, true).await else {
                        continue;
                    };
                    for instance in instances {
                        let healthy = inner.transport.check_health(&instance).await;
                        inner.balancer.record_check(&instance.id, healthy);
                    }
                }
            }
        });

        let mut background = self.inner.background.lock().expect("Mesh background poisoned");
        background.push(health_task.abort_handle());
        background.push(check_task.abort_handle());
    }

    fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.inner.breakers.lock().expect("Mesh breakers poisoned");
        if let Some(breaker) = breakers.get(service) {
            return breaker.clone();
        }
        let strategy = self.make_strategy();
        let breaker = Arc::new(CircuitBreaker::new(
            service,
            self.inner.config.circuit.clone(),
            self.inner.clock.clone(),
            self.inner.sink.clone(),
            strategy,
            self.inner.slots.clone(),
        ));
        self.inner.breaker_registry.register(&breaker);
        breakers.insert(service.to_string(), breaker.clone());
        breaker
    }

    fn make_strategy(&self) -> BreakerStrategy {
        let inner = &self.inner;
        match inner.config.circuit.strategy {
            CircuitStrategyKind::Basic => BreakerStrategy::Basic,
            CircuitStrategyKind::Gradual => {
                BreakerStrategy::gradual(inner.clock.clone(), GRADUAL_STABLE_WINDOW)
            }
            CircuitStrategyKind::Dependency => {
                BreakerStrategy::dependency_aware(inner.deps.clone())
            }
            CircuitStrategyKind::RateLimited => BreakerStrategy::rate_limited(Arc::new(
                RateLimiter::new(inner.config.rate_limit.clone(), inner.clock.clone()),
            )),
            CircuitStrategyKind::HealthAware => {
                BreakerStrategy::health_aware(inner.health.clone())
            }
            CircuitStrategyKind::Predictive => BreakerStrategy::predictive(
                inner.predictor.clone(),
                inner.config.predictor.deny_product,
            ),
        }
    }

    fn window_for(&self, service: &str) -> Arc<RollingWindow> {
        let mut windows = self.inner.windows.lock().expect("Mesh windows poisoned");
        windows
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(RollingWindow::with_defaults(self.inner.clock.clone())))
            .clone()
    }

    /// Single entry point: fault-tolerant call to `operation` on `service`.
    pub async fn call(
        &self,
        service: &str,
        operation: &str,
        payload: &[u8],
        opts: CallOptions,
    ) -> Result<Vec<u8>, CallFailure<T::Error>> {
        let inner = &self.inner;
        let started = inner.clock.now_millis();

        let fail = |error: MeshError<T::Error>, attempts: usize, now: u64| {
            let elapsed = Duration::from_millis(now.saturating_sub(started));
            inner.sink.counter(
                "mesh_errors_total",
                &[("service", service), ("kind", error.kind().as_str())],
                1,
            );
            inner.sink.event(
                "call_failed",
                &[("service", service), ("kind", error.kind().as_str())],
            );
            CallFailure { service: service.to_string(), attempts, elapsed, error }
        };

        inner.sink.counter("mesh_requests_total", &[("service", service)], 1);

        if inner.closed.load(Ordering::Acquire) {
            return Err(fail(
                MeshError::Config(ConfigError::invalid("mesh", "closed")),
                0,
                inner.clock.now_millis(),
            ));
        }

        // Front-door rate limit: denials return immediately, nothing queues.
        if let Decision::Denied { wait, reason } = inner.rate_limiter.admit() {
            return Err(fail(
                MeshError::RateLimited { wait, reason },
                0,
                inner.clock.now_millis(),
            ));
        }

        let breaker = self.breaker_for(service);
        let cancel = opts.cancel.clone().unwrap_or_default();
        let priority = opts.priority;
        let use_cache = !opts.skip_discovery_cache;

        let mut session = match opts.trace_id {
            Some(trace_id) => RetrySession::with_trace_id(trace_id),
            None => RetrySession::new(),
        }
        .with_fingerprint(Fingerprint::new(service, operation, payload))
        .with_cancel(cancel.clone());
        session.utilization =
            inner.health.resource(service, ResourceKind::Cpu).map(|r| r.util).unwrap_or(0.0);

        let window = self.window_for(service);

        let result = inner
            .retry
            .execute(&mut session, |_attempt| {
                let breaker = breaker.clone();
                let window = window.clone();
                let cancel = cancel.clone();
                let inner = Arc::clone(inner);
                async move {
                    inner.attempt(
                        &breaker,
                        &window,
                        &cancel,
                        service,
                        operation,
                        payload,
                        priority,
                        use_cache,
                    )
                    .await
                }
            })
            .await;

        let now = inner.clock.now_millis();
        let attempts = session.attempts().len().max(1);
        match result {
            Ok(bytes) => {
                inner.sink.histogram(
                    "mesh_call_attempts",
                    &[("service", service)],
                    attempts as f64,
                );
                Ok(bytes)
            }
            Err(error) => Err(fail(error, attempts, now)),
        }
    }

    /// Register this process as an instance of `service`.
    pub async fn register(
        &self,
        service: &str,
        host: &str,
        port: u16,
        tags: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, MeshError<T::Error>> {
        let id = self
            .inner
            .discovery
            .register(service, host, port, tags, metadata)
            .await
            .map_err(|e| registry_error(service, e))?;
        self.inner
            .registrations
            .lock()
            .expect("Mesh registrations poisoned")
            .insert(id.clone(), service.to_string());
        Ok(id)
    }

    /// Deregister a previously registered service id.
    pub async fn deregister(&self, service_id: &str) -> Result<(), MeshError<T::Error>> {
        let service = self
            .inner
            .registrations
            .lock()
            .expect("Mesh registrations poisoned")
            .remove(service_id);
        let Some(service) = service else {
            return Err(MeshError::ServiceNotFound { service: service_id.to_string() });
        };
        self.inner
            .discovery
            .deregister(&service, service_id)
            .await
            .map_err(|e| registry_error(&service, e))
    }

    /// Current instances of `service` (cached).
    pub async fn discover(&self, service: &str) -> Result<Vec<Instance>, MeshError<T::Error>> {
        self.inner
            .discovery
            .discover(service, true)
            .await
            .map_err(|e| registry_error(service, e))
    }

    /// Watch `service` for instance changes.
    pub fn watch(
        &self,
        service: &str,
        callback: impl Fn(Vec<Instance>) + Send + Sync + 'static,
    ) -> WatchHandle {
        self.inner.discovery.watch(service, callback)
    }

    /// Evaluate and return the current health status of `service`.
    pub fn health_status(&self, service: &str) -> HealthStatus {
        self.inner.health.status(service)
    }

    /// Declare that `from` depends on `to`.
    pub fn update_dependency(&self, from: &str, to: &str, kind: DependencyKind, impact: f64) {
        self.inner.deps.add(from, to, kind, impact);
    }

    /// The process-wide dependency graph.
    pub fn dependency_chain(&self) -> Arc<DependencyChain> {
        self.inner.deps.clone()
    }

    /// Gracefully drain one instance, then remove its registration.
    pub async fn drain(&self, service: &str, instance_id: &str) -> bool {
        let timeout = self.inner.balancer.drain_timeout();
        let drained = self.inner.balancer.drain(instance_id, timeout).await;
        if let Err(error) = self.inner.discovery.deregister(service, instance_id).await {
            tracing::debug!(service, instance = instance_id, %error, "drain deregistration");
        }
        drained
    }

    /// Raise the priority floor to shed low-priority load.
    pub fn set_priority_floor(&self, priority: Priority) {
        self.inner.slots.set_floor(priority);
    }

    /// Circuit state for a service (Closed when never called).
    pub fn circuit_state(&self, service: &str) -> CircuitState {
        self.inner
            .breakers
            .lock()
            .expect("Mesh breakers poisoned")
            .get(service)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Named breaker handles for operational tooling.
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.inner.breaker_registry.clone()
    }

    /// Stop background loops and refuse further calls.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.discovery.close();
        for task in self.inner.background.lock().expect("Mesh background poisoned").drain(..) {
            task.abort();
        }
        tracing::info!("mesh closed");
    }
}

fn registry_error<E>(service: &str, error: RegistryError) -> MeshError<E> {
    match error {
        RegistryError::NotFound(_) => {
            MeshError::ServiceNotFound { service: service.to_string() }
        }
        other => MeshError::DiscoveryUnavailable {
            service: service.to_string(),
            detail: other.to_string(),
        },
    }
}

impl<T: Transport> MeshInner<T> {
    /// One attempt: admit, route, lease, invoke under deadline, record.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        self: &Arc<Self>,
        breaker: &CircuitBreaker,
        window: &RollingWindow,
        cancel: &CancellationToken,
        service: &str,
        operation: &str,
        payload: &[u8],
        priority: Priority,
        use_cache: bool,
    ) -> Result<Vec<u8>, MeshError<T::Error>> {
        let permit = breaker.admit(priority).map_err(|d| d.into_error(service))?;

        let instances = match self.discovery.discover(service, use_cache).await {
            Ok(instances) => instances,
            Err(error) => {
                // Routing errors bubble without touching failure accounting.
                breaker.record_cancelled(permit);
                return Err(registry_error(service, error));
            }
        };

        let Some((instance, lease)) = self.balancer.pick(&instances) else {
            breaker.record_cancelled(permit);
            return Err(MeshError::NoHealthyInstance {
                service: service.to_string(),
                candidates: instances.len(),
            });
        };

        let limit = self
            .config
            .retry
            .timeout_per_attempt_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.timeouts.get(service));

        let attempt_start = self.clock.now_millis();
        let result = tokio::select! {
            outcome = tokio::time::timeout(
                limit,
                self.transport.invoke(&instance, operation, payload),
            ) => match outcome {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(error)) => Err(MeshError::Transport(error)),
                Err(_) => Err(MeshError::Timeout { elapsed: limit, limit }),
            },
            _ = cancel.cancelled() => Err(MeshError::Cancelled {
                elapsed: Duration::from_millis(
                    self.clock.now_millis().saturating_sub(attempt_start),
                ),
            }),
        };
        let latency =
            Duration::from_millis(self.clock.now_millis().saturating_sub(attempt_start));

        match &result {
            Ok(_) => {
                breaker.record_success(permit);
                self.record_outcome(window, service, &instance.id, latency, true);
            }
            Err(error) if error.is_cancelled() => {
                // Cancellation is not a failure for breaker accounting.
                breaker.record_cancelled(permit);
            }
            Err(_) => {
                breaker.record_failure(permit);
                self.record_outcome(window, service, &instance.id, latency, false);
            }
        }
        drop(lease);

        result
    }

    fn record_outcome(
        &self,
        window: &RollingWindow,
        service: &str,
        instance_id: &str,
        latency: Duration,
        success: bool,
    ) {
        window.record_outcome(latency, success);
        self.balancer.record_outcome(instance_id, latency, success);
        self.timeouts.observe(service, latency, success);
        self.health.record_outcome(service, latency, success);
        self.rate_limiter.record_outcome(success);

        let totals = window.totals();
        self.predictor.observe(service, MetricKind::Latency, latency.as_millis() as f64);
        self.predictor.observe(service, MetricKind::ErrorRate, totals.error_rate());
        self.predictor.observe(service, MetricKind::RequestRate, totals.requests as f64);

        self.sink.histogram(
            "mesh_attempt_latency_ms",
            &[("service", service)],
            latency.as_millis() as f64,
        );
        if !success {
            self.sink.counter("mesh_attempt_failures_total", &[("service", service)], 1);
        }
    }
}

impl<T: Transport> std::fmt::Debug for Mesh<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh").field("config", &self.inner.config).finish()
    }
}
