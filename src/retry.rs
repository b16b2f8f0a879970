//! Retry engine: attempt loop with classification, backoff, and budget.
//!
//! `execute` drives an async operation through up to `max_attempts` tries.
//! Errors are classified through the policy's `retry_on` predicate (defaults
//! to the taxonomy: only `Transport` and `Timeout` retry). A wall-time budget
//! bounds the whole loop: if the elapsed time plus the next computed delay
//! would exceed it, the loop aborts with `BudgetExhausted` instead of
//! sleeping. All sleeps race the session's cancellation token.
//!
//! Attempts within one session are strictly sequential; `execute` takes the
//! session by `&mut` so a second in-flight attempt cannot exist.

use crate::backoff::{AttemptOutcome, Backoff, BackoffContext, BackoffSession};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, MonotonicClock, Timer, TokioTimer};
use crate::config::{BackoffConfig, RetryConfig};
use crate::error::{ConfigError, ErrorKind, MeshError};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Deterministic identity of a logical request, for metric correlation and
/// deduping concurrent identical retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// FNV-1a over (service, operation, payload).
    pub fn new(service: &str, operation: &str, payload: &[u8]) -> Self {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for chunk in [service.as_bytes(), b"\x1f", operation.as_bytes(), b"\x1f", payload] {
            for &byte in chunk {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        }
        Self(hash)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// One attempt's record inside a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryAttempt {
    /// 1-indexed attempt number.
    pub index: u32,
    /// Backoff delay that preceded this attempt (zero for the first).
    pub scheduled_delay: Duration,
    pub observed_latency: Duration,
    /// Whether the attempt ended the session with a terminal error.
    pub terminal: bool,
}

/// Identity and history for one logical call's retry sequence.
#[derive(Debug, Clone)]
pub struct RetrySession {
    /// Caller-supplied or generated trace id; propagated so the circuit
    /// breaker and predictor can correlate.
    pub trace_id: String,
    pub fingerprint: Option<Fingerprint>,
    pub cancel: CancellationToken,
    /// Observed resource utilization fed to resource-sensitive backoff.
    pub utilization: f64,
    backoff: BackoffSession,
    attempts: Vec<RetryAttempt>,
}

impl RetrySession {
    pub fn new() -> Self {
        Self::with_trace_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            fingerprint: None,
            cancel: CancellationToken::new(),
            utilization: 0.0,
            backoff: BackoffSession::new(),
            attempts: Vec::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn attempts(&self) -> &[RetryAttempt] {
        &self.attempts
    }

    pub fn backoff_session(&self) -> &BackoffSession {
        &self.backoff
    }
}

impl Default for RetrySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Configurable retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: bool,
    jitter_factor: f64,
    budget: Option<Duration>,
    timeout_per_attempt: Option<Duration>,
    retry_on: Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>,
    timer: Arc<dyn Timer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("budget", &self.budget)
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Build from config sections.
    pub fn from_config(retry: &RetryConfig, backoff: &BackoffConfig) -> Result<Self, ConfigError> {
        RetryPolicyBuilder::new()
            .max_attempts(retry.max_attempts)?
            .backoff(Backoff::from_config(backoff, retry))
            .jitter(retry.jitter, retry.jitter_factor)
            .budget(retry.budget())
            .timeout_per_attempt(retry.timeout_per_attempt_ms.map(Duration::from_millis))
            .build()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive `op` until success, a terminal error, exhaustion, or budget end.
    ///
    /// `op` receives the 1-indexed attempt number. Per-attempt timeouts and
    /// backoff sleeps race the session's cancellation token.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        session: &mut RetrySession,
        mut op: Op,
    ) -> Result<T, MeshError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, MeshError<E>>>,
    {
        let started = self.clock.now_millis();
        let mut scheduled_delay = Duration::ZERO;

        for attempt in 1..=self.max_attempts {
            if session.cancel.is_cancelled() {
                return Err(MeshError::Cancelled { elapsed: self.elapsed_since(started) });
            }

            let attempt_start = self.clock.now_millis();
            let result = self.run_attempt(session, &mut op, attempt).await;
            let latency = Duration::from_millis(
                self.clock.now_millis().saturating_sub(attempt_start),
            );

            match result {
                Ok(value) => {
                    self.record(session, attempt, scheduled_delay, latency, true, false);
                    return Ok(value);
                }
                Err(err) => {
                    if err.is_cancelled() {
                        return Err(MeshError::Cancelled { elapsed: self.elapsed_since(started) });
                    }

                    let retryable = (self.retry_on)(err.kind());
                    let last = attempt == self.max_attempts;
                    if !retryable || last {
                        self.record(session, attempt, scheduled_delay, latency, false, true);
                        return Err(err);
                    }
                    self.record(session, attempt, scheduled_delay, latency, false, false);

                    let ctx = BackoffContext { utilization: session.utilization };
                    let mut delay = self.backoff.next_delay(&mut session.backoff, attempt, &ctx);
                    if self.jitter {
                        delay = apply_jitter(delay, self.jitter_factor);
                    }

                    if let Some(budget) = self.budget {
                        let elapsed = self.elapsed_since(started);
                        if elapsed + delay > budget {
                            return Err(MeshError::BudgetExhausted {
                                attempts: attempt as usize,
                                elapsed,
                                budget,
                            });
                        }
                    }

                    scheduled_delay = delay;
                    tokio::select! {
                        _ = self.timer.wait(delay) => {}
                        _ = session.cancel.cancelled() => {
                            return Err(MeshError::Cancelled {
                                elapsed: self.elapsed_since(started),
                            });
                        }
                    }
                }
            }
        }

        unreachable!("retry loop returns from within the final attempt")
    }

    async fn run_attempt<T, E, Fut, Op>(
        &self,
        session: &RetrySession,
        op: &mut Op,
        attempt: u32,
    ) -> Result<T, MeshError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, MeshError<E>>>,
    {
        let fut = op(attempt);
        match self.timeout_per_attempt {
            Some(limit) => {
                tokio::select! {
                    outcome = tokio::time::timeout(limit, fut) => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(MeshError::Timeout { elapsed: limit, limit }),
                    },
                    _ = session.cancel.cancelled() => {
                        Err(MeshError::Cancelled { elapsed: Duration::ZERO })
                    }
                }
            }
            None => {
                tokio::select! {
                    result = fut => result,
                    _ = session.cancel.cancelled() => {
                        Err(MeshError::Cancelled { elapsed: Duration::ZERO })
                    }
                }
            }
        }
    }

    fn record(
        &self,
        session: &mut RetrySession,
        attempt: u32,
        scheduled_delay: Duration,
        latency: Duration,
        success: bool,
        terminal: bool,
    ) {
        session.attempts.push(RetryAttempt {
            index: attempt,
            scheduled_delay,
            observed_latency: latency,
            terminal,
        });
        session.backoff.record_outcome(AttemptOutcome {
            success,
            latency,
            at_millis: self.clock.now_millis(),
        });
    }

    fn elapsed_since(&self, started: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(started))
    }
}

/// Uniform jitter in `[delay·(1−f), delay·(1+f)]`.
fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis() as u64;
    let spread = (millis as f64 * factor) as u64;
    if spread == 0 {
        return delay;
    }
    let lo = millis.saturating_sub(spread);
    let hi = millis.saturating_add(spread);
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: bool,
    jitter_factor: f64,
    budget: Option<Duration>,
    timeout_per_attempt: Option<Duration>,
    retry_on: Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>,
    timer: Arc<dyn Timer>,
    clock: Arc<dyn Clock>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: true,
            jitter_factor: 0.5,
            budget: None,
            timeout_per_attempt: None,
            retry_on: Arc::new(|kind| {
                matches!(kind, ErrorKind::Transport | ErrorKind::Timeout)
            }),
            timer: Arc::new(TokioTimer),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Result<Self, ConfigError> {
        if !(1..=10).contains(&attempts) {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                format!("must be in 1..=10 (got {})", attempts),
            ));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, enabled: bool, factor: f64) -> Self {
        self.jitter = enabled;
        self.jitter_factor = factor;
        self
    }

    pub fn budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn timeout_per_attempt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_per_attempt = timeout;
        self
    }

    /// Override which error kinds retry.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn with_timer<S: Timer + 'static>(mut self, timer: S) -> Self {
        self.timer = Arc::new(timer);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid("retry.jitter_factor", "must be in [0, 1]"));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            jitter_factor: self.jitter_factor,
            budget: self.budget,
            timeout_per_attempt: self.timeout_per_attempt,
            retry_on: self.retry_on,
            timer: self.timer,
            clock: self.clock,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
