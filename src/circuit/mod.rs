//! Circuit breaker: admission control with Closed → Open → HalfOpen recovery.
//!
//! The state machine is a packed atomic word plus counters, transitioned by
//! CAS so concurrent recorders serialize without a lock (readers always see
//! a consistent snapshot). Failures count within a rolling window; reaching
//! the threshold opens the circuit. After the reset timeout the first caller
//! wins the race into HalfOpen, where at most `half_open_max_calls` probes
//! are admitted per episode and `success_threshold` consecutive successes
//! close the circuit again. Any probe failure reopens it with a fresh timer.
//!
//! Strategies ([`strategy::BreakerStrategy`]) refine admission and recording:
//! gradual recovery, dependency-aware, rate-limited, health-aware, and
//! predictive. Priority slots ([`priority::PrioritySlots`]) gate every
//! admission regardless of strategy.

pub mod priority;
pub mod registry;
pub mod strategy;

use crate::clock::Clock;
use crate::config::CircuitConfig;
use crate::error::MeshError;
use crate::health::HealthStatus;
use crate::metrics::MetricsSink;
use priority::{Priority, PrioritySlots, SlotToken};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strategy::{BreakerStrategy, HalfOpenGate};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Shared state word and counters, CAS-transitioned.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    failure_count: AtomicU64,
    window_start_ms: AtomicU64,
    success_streak: AtomicU64,
    opened_at_ms: AtomicU64,
    /// Probes admitted in the current half-open episode (cumulative).
    half_open_admitted: AtomicU64,
    trips: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(0),
            success_streak: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_admitted: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Force back to Closed, clearing counters. Operational override.
    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_streak.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
        self.half_open_admitted.store(0, Ordering::Release);
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    Open { failure_count: u64, open_for: Duration },
    ProbeLimit { failure_count: u64 },
    DependencyUnhealthy { dependency: String },
    RateLimited { wait: Duration, reason: String },
    HealthShed { status: HealthStatus },
    Predicted { likelihood: f64, confidence: f64 },
    SlotsExhausted { priority: Priority },
}

impl DenialReason {
    /// Map to the public error taxonomy.
    pub fn into_error<E>(self, service: &str) -> MeshError<E> {
        match self {
            Self::Open { failure_count, open_for } => MeshError::CircuitOpen {
                service: service.to_string(),
                failure_count,
                open_for,
                cause: None,
            },
            Self::ProbeLimit { failure_count } => MeshError::CircuitOpen {
                service: service.to_string(),
                failure_count,
                open_for: Duration::ZERO,
                cause: Some("half_open_probe_limit".to_string()),
            },
            Self::DependencyUnhealthy { dependency } => MeshError::CircuitOpen {
                service: service.to_string(),
                failure_count: 0,
                open_for: Duration::ZERO,
                cause: Some(format!("dependency_unhealthy:{}", dependency)),
            },
            Self::RateLimited { wait, reason } => MeshError::RateLimited { wait, reason },
            Self::HealthShed { status } => MeshError::CircuitOpen {
                service: service.to_string(),
                failure_count: 0,
                open_for: Duration::ZERO,
                cause: Some(format!("health_shed:{}", status)),
            },
            Self::Predicted { likelihood, confidence } => MeshError::PredictedFailure {
                service: service.to_string(),
                likelihood,
                confidence,
            },
            Self::SlotsExhausted { priority } => MeshError::RateLimited {
                wait: Duration::ZERO,
                reason: format!("priority_slots_exhausted:{}", priority.as_str()),
            },
        }
    }
}

/// Proof of admission; hand it back through exactly one `record_*` call.
#[derive(Debug, Clone, Copy)]
pub struct CallPermit {
    token: SlotToken,
    probe: bool,
}

/// Per-service admission gate.
pub struct CircuitBreaker {
    service: String,
    config: CircuitConfig,
    shared: Arc<SharedState>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    strategy: BreakerStrategy,
    slots: Arc<PrioritySlots>,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
        strategy: BreakerStrategy,
        slots: Arc<PrioritySlots>,
    ) -> Self {
        Self {
            service: service.into(),
            config,
            shared: Arc::new(SharedState::new()),
            clock,
            sink,
            strategy,
            slots,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.shared.current_state()
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn trips(&self) -> u64 {
        self.shared.trips.load(Ordering::Acquire)
    }

    /// Request admission for one call at `priority`.
    pub fn admit(&self, priority: Priority) -> Result<CallPermit, DenialReason> {
        // Predictive strategies veto before the state machine is touched.
        self.strategy.pre_admit(&self.service)?;

        let probe = self.admit_state_machine()?;

        if let Err(denial) = self.strategy.check_admit(&self.service, priority) {
            if probe {
                self.shared.half_open_admitted.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(denial);
        }

        let Some(token) = self.slots.try_acquire(priority) else {
            if probe {
                self.shared.half_open_admitted.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(DenialReason::SlotsExhausted { priority });
        };

        Ok(CallPermit { token, probe })
    }

    /// Base machine gate. Returns whether the admission is a half-open probe.
    fn admit_state_machine(&self) -> Result<bool, DenialReason> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(false),
                STATE_OPEN => {
                    let opened_at = self.shared.opened_at_ms.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed < self.config.reset_timeout_ms {
                        return Err(DenialReason::Open {
                            failure_count: self.shared.failure_count.load(Ordering::Acquire),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.shared.half_open_admitted.store(0, Ordering::Release);
                            self.shared.success_streak.store(0, Ordering::Release);
                            self.strategy.on_half_open(&self.service);
                            tracing::info!(service = %self.service, "circuit half-open");
                            self.sink.event("circuit_half_open", &[("service", &self.service)]);
                            // Fall through to half-open admission below.
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    match self.strategy.half_open_gate() {
                        HalfOpenGate::Cap => {
                            let admitted =
                                self.shared.half_open_admitted.fetch_add(1, Ordering::AcqRel);
                            if admitted >= self.config.half_open_max_calls as u64 {
                                self.shared.half_open_admitted.fetch_sub(1, Ordering::AcqRel);
                                return Err(DenialReason::ProbeLimit {
                                    failure_count: self
                                        .shared
                                        .failure_count
                                        .load(Ordering::Acquire),
                                });
                            }
                            return Ok(true);
                        }
                        HalfOpenGate::Rate(rate) => {
                            if rand::random::<f64>() < rate {
                                self.shared.half_open_admitted.fetch_add(1, Ordering::AcqRel);
                                return Ok(true);
                            }
                            return Err(DenialReason::Open {
                                failure_count: self.shared.failure_count.load(Ordering::Acquire),
                                open_for: Duration::ZERO,
                            });
                        }
                    }
                }
                _ => unreachable!("invalid circuit state"),
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, permit: CallPermit) {
        self.slots.release(permit.token);
        self.strategy.on_outcome(&self.service, true, permit.probe);

        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if let Some(rate) = self.strategy.gradual_rate() {
                    // Gradual recovery closes only once full rate is restored.
                    if rate >= 1.0
                        && self
                            .shared
                            .state
                            .compare_exchange(
                                STATE_HALF_OPEN,
                                STATE_CLOSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        self.on_closed();
                    }
                    return;
                }
                let streak = self.shared.success_streak.fetch_add(1, Ordering::AcqRel) + 1;
                if streak >= self.config.success_threshold as u64
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.on_closed();
                }
            }
            STATE_CLOSED => {
                let streak = self.shared.success_streak.fetch_add(1, Ordering::AcqRel) + 1;
                // Sustained success clears accumulated failures.
                if streak >= self.config.failure_threshold as u64 {
                    self.shared.failure_count.store(0, Ordering::Release);
                    self.shared.success_streak.store(0, Ordering::Release);
                }
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, permit: CallPermit) {
        self.slots.release(permit.token);
        self.strategy.on_outcome(&self.service, false, permit.probe);
        self.shared.success_streak.store(0, Ordering::Release);

        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self.strategy.gradual_rate().is_some() {
                    // Gradual recovery absorbs probe failures by halving the
                    // admission rate instead of reopening.
                    return;
                }
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.opened_at_ms.store(self.clock.now_millis(), Ordering::Release);
                    self.shared.trips.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!(service = %self.service, "half-open probe failed, circuit open");
                    self.sink.event("circuit_reopened", &[("service", &self.service)]);
                }
            }
            STATE_CLOSED => {
                let now = self.clock.now_millis();
                let window_start = self.shared.window_start_ms.load(Ordering::Acquire);
                if now.saturating_sub(window_start) > self.config.window_ms {
                    self.shared.window_start_ms.store(now, Ordering::Release);
                    self.shared.failure_count.store(0, Ordering::Release);
                }
                let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold as u64
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.opened_at_ms.store(now, Ordering::Release);
                    self.shared.trips.fetch_add(1, Ordering::AcqRel);
                    tracing::error!(
                        service = %self.service,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit open"
                    );
                    self.sink.event("circuit_opened", &[("service", &self.service)]);
                    self.sink.counter("mesh_circuit_trips_total", &[("service", &self.service)], 1);
                }
            }
            _ => {}
        }
    }

    /// Record a cancelled call: releases the slot without touching failure
    /// accounting.
    pub fn record_cancelled(&self, permit: CallPermit) {
        self.slots.release(permit.token);
    }

    fn on_closed(&self) {
        self.shared.failure_count.store(0, Ordering::Release);
        self.shared.success_streak.store(0, Ordering::Release);
        self.shared.opened_at_ms.store(0, Ordering::Release);
        tracing::info!(service = %self.service, "circuit closed");
        self.sink.event("circuit_closed", &[("service", &self.service)]);
        self.sink.counter("mesh_circuit_recoveries_total", &[("service", &self.service)], 1);
    }

    /// Functional wrapper: admit, run `op`, record the outcome.
    pub async fn guard<T, E, Fut, Op>(
        &self,
        priority: Priority,
        op: Op,
    ) -> Result<T, MeshError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MeshError<E>>>,
    {
        let permit = self.admit(priority).map_err(|d| d.into_error(&self.service))?;
        match op().await {
            Ok(value) => {
                self.record_success(permit);
                Ok(value)
            }
            Err(err) if err.is_cancelled() => {
                self.record_cancelled(permit);
                Err(err)
            }
            Err(err) => {
                self.record_failure(permit);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}
