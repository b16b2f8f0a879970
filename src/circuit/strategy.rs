//! Circuit breaker strategies.
//!
//! A strategy refines the base state machine at fixed points: a veto before
//! the state word is touched (`pre_admit`), an extra admission check after
//! it (`check_admit`), the half-open gate shape (probe cap or admission
//! rate), and outcome feedback. Strategies are immutable configuration plus
//! their own interior state; the base machine never knows which one it runs.

use super::priority::Priority;
use super::DenialReason;
use crate::adaptive::Adaptive;
use crate::clock::Clock;
use crate::dependency::{DependencyChain, DependencyKind};
use crate::health::{HealthMonitor, HealthStatus};
use crate::predictor::FailurePredictor;
use crate::rate_limit::{Decision, RateLimiter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the half-open state admits traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum HalfOpenGate {
    /// Bounded probe count (the base machine's cap).
    Cap,
    /// Probabilistic admission at the given rate.
    Rate(f64),
}

/// Initial admission rate when gradual recovery enters half-open.
const GRADUAL_INITIAL_RATE: f64 = 0.1;
/// Error rate a window must stay under to count as stable.
const GRADUAL_MAX_ERROR_RATE: f64 = 0.02;

#[derive(Debug, Default)]
struct GradualWindow {
    started_ms: u64,
    requests: u64,
    errors: u64,
}

/// Gradual recovery: half-open admission starts at 10% and doubles per
/// stable window; any failure halves it and restarts the window.
#[derive(Debug)]
pub struct GradualRecovery {
    rate: Adaptive<f64>,
    stable_window: Duration,
    clock: Arc<dyn Clock>,
    window: Mutex<GradualWindow>,
}

impl GradualRecovery {
    pub fn new(clock: Arc<dyn Clock>, stable_window: Duration) -> Self {
        Self {
            rate: Adaptive::new(1.0),
            stable_window,
            clock,
            window: Mutex::new(GradualWindow::default()),
        }
    }

    pub fn rate(&self) -> f64 {
        *self.rate.get()
    }

    fn reset_episode(&self) {
        self.rate.set(GRADUAL_INITIAL_RATE);
        let mut window = self.window.lock().expect("gradual window poisoned");
        *window = GradualWindow { started_ms: self.clock.now_millis(), requests: 0, errors: 0 };
    }

    fn record(&self, service: &str, success: bool) {
        let now = self.clock.now_millis();
        let mut window = self.window.lock().expect("gradual window poisoned");
        window.requests += 1;
        if !success {
            window.errors += 1;
            let halved = (self.rate() / 2.0).max(GRADUAL_INITIAL_RATE);
            self.rate.set(halved);
            *window = GradualWindow { started_ms: now, requests: 0, errors: 0 };
            tracing::debug!(service, rate = halved, "gradual recovery setback");
            return;
        }

        let elapsed = now.saturating_sub(window.started_ms);
        if elapsed >= self.stable_window.as_millis() as u64 && window.requests > 0 {
            let error_rate = window.errors as f64 / window.requests as f64;
            if error_rate <= GRADUAL_MAX_ERROR_RATE {
                let doubled = (self.rate() * 2.0).min(1.0);
                self.rate.set(doubled);
                tracing::debug!(service, rate = doubled, "gradual recovery step");
            }
            *window = GradualWindow { started_ms: now, requests: 0, errors: 0 };
        }
    }
}

/// Dependency-aware admission: Critical dependencies must not be Unhealthy,
/// Required dependencies must not be Unhealthy. Denials are counted per
/// dependency.
#[derive(Debug)]
pub struct DependencyAware {
    deps: Arc<DependencyChain>,
    denials: Mutex<HashMap<String, u64>>,
}

impl DependencyAware {
    pub fn new(deps: Arc<DependencyChain>) -> Self {
        Self { deps, denials: Mutex::new(HashMap::new()) }
    }

    /// Times admission was denied because of `dependency`.
    pub fn denials_for(&self, dependency: &str) -> u64 {
        self.denials
            .lock()
            .expect("dependency denials poisoned")
            .get(dependency)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, service: &str) -> Result<(), DenialReason> {
        for (dependency, kind, status) in self.deps.dependencies_of(service) {
            let blocking = match kind {
                DependencyKind::Critical | DependencyKind::Required => {
                    status == HealthStatus::Unhealthy
                }
                DependencyKind::Optional | DependencyKind::Fallback => false,
            };
            if blocking {
                *self
                    .denials
                    .lock()
                    .expect("dependency denials poisoned")
                    .entry(dependency.clone())
                    .or_insert(0) += 1;
                return Err(DenialReason::DependencyUnhealthy { dependency });
            }
        }
        Ok(())
    }
}

/// Predictive admission: deny when the predictor's risk product crosses the
/// configured line.
#[derive(Debug)]
pub struct Predictive {
    predictor: Arc<FailurePredictor>,
    deny_product: f64,
    predicted_trips: AtomicU64,
}

impl Predictive {
    pub fn new(predictor: Arc<FailurePredictor>, deny_product: f64) -> Self {
        Self { predictor, deny_product, predicted_trips: AtomicU64::new(0) }
    }

    pub fn predicted_trips(&self) -> u64 {
        self.predicted_trips.load(Ordering::Acquire)
    }
}

/// Admission/recording overrides for the circuit breaker.
#[derive(Debug)]
pub enum BreakerStrategy {
    Basic,
    GradualRecovery(GradualRecovery),
    DependencyAware(DependencyAware),
    RateLimited(Arc<RateLimiter>),
    HealthAware(Arc<HealthMonitor>),
    Predictive(Predictive),
}

impl BreakerStrategy {
    pub fn gradual(clock: Arc<dyn Clock>, stable_window: Duration) -> Self {
        Self::GradualRecovery(GradualRecovery::new(clock, stable_window))
    }

    pub fn dependency_aware(deps: Arc<DependencyChain>) -> Self {
        Self::DependencyAware(DependencyAware::new(deps))
    }

    pub fn rate_limited(limiter: Arc<RateLimiter>) -> Self {
        Self::RateLimited(limiter)
    }

    pub fn health_aware(health: Arc<HealthMonitor>) -> Self {
        Self::HealthAware(health)
    }

    pub fn predictive(predictor: Arc<FailurePredictor>, deny_product: f64) -> Self {
        Self::Predictive(Predictive::new(predictor, deny_product))
    }

    /// Veto before the state machine runs.
    pub(crate) fn pre_admit(&self, service: &str) -> Result<(), DenialReason> {
        if let Self::Predictive(predictive) = self {
            let prediction = predictive.predictor.predict(service);
            if prediction.risk() > predictive.deny_product {
                predictive.predicted_trips.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(
                    service,
                    likelihood = prediction.likelihood,
                    confidence = prediction.confidence,
                    "predicted trip"
                );
                return Err(DenialReason::Predicted {
                    likelihood: prediction.likelihood,
                    confidence: prediction.confidence,
                });
            }
        }
        Ok(())
    }

    /// Additional admission requirement after the state machine admits.
    pub(crate) fn check_admit(&self, service: &str, priority: Priority) -> Result<(), DenialReason> {
        match self {
            Self::Basic | Self::GradualRecovery(_) | Self::Predictive(_) => Ok(()),
            Self::DependencyAware(dep) => dep.check(service),
            Self::RateLimited(limiter) => match limiter.admit() {
                Decision::Allowed { .. } => Ok(()),
                Decision::Denied { wait, reason } => {
                    Err(DenialReason::RateLimited { wait, reason })
                }
            },
            Self::HealthAware(health) => match health.status(service) {
                // Unhealthy admits nothing, whatever the circuit state.
                HealthStatus::Unhealthy => {
                    Err(DenialReason::HealthShed { status: HealthStatus::Unhealthy })
                }
                HealthStatus::Degraded => {
                    if degraded_admit(priority, rand::random::<f64>()) {
                        Ok(())
                    } else {
                        Err(DenialReason::HealthShed { status: HealthStatus::Degraded })
                    }
                }
                HealthStatus::Healthy | HealthStatus::Unknown => Ok(()),
            },
        }
    }

    /// Shape of the half-open gate.
    pub(crate) fn half_open_gate(&self) -> HalfOpenGate {
        match self {
            Self::GradualRecovery(gradual) => HalfOpenGate::Rate(gradual.rate()),
            _ => HalfOpenGate::Cap,
        }
    }

    /// Called when the circuit enters half-open.
    pub(crate) fn on_half_open(&self, service: &str) {
        if let Self::GradualRecovery(gradual) = self {
            gradual.reset_episode();
            tracing::info!(service, rate = GRADUAL_INITIAL_RATE, "gradual recovery started");
        }
    }

    /// Outcome feedback. `probe` marks half-open traffic.
    pub(crate) fn on_outcome(&self, service: &str, success: bool, probe: bool) {
        match self {
            Self::GradualRecovery(gradual) if probe => gradual.record(service, success),
            Self::RateLimited(limiter) => limiter.record_outcome(success),
            _ => {}
        }
    }

    /// Current gradual admission rate, if this strategy is gradual.
    pub(crate) fn gradual_rate(&self) -> Option<f64> {
        match self {
            Self::GradualRecovery(gradual) => Some(gradual.rate()),
            _ => None,
        }
    }
}

/// Degraded services admit half their traffic: High and Critical always
/// pass, lower priorities pass only on the coin flip.
fn degraded_admit(priority: Priority, roll: f64) -> bool {
    priority.level() >= Priority::High.level() || roll < 0.5
}
