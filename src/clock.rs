//! Time seams for the mesh: reading the clock and waiting on it.
//!
//! Every time-dependent component (circuit breakers, rate limiters, metric
//! windows, the retry engine) goes through [`Clock`] for "what time is it"
//! and [`Timer`] for "wake me later". Swapping in [`ManualClock`] and
//! [`RecordingTimer`] makes recovery timeouts and backoff schedules fully
//! deterministic under test, with no real time passing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Waiting seam for backoff pauses between retry attempts. Implementations
/// must be cancellation-safe: the retry engine races every wait against the
/// call's cancellation token.
#[async_trait]
pub trait Timer: Send + Sync + std::fmt::Debug {
    async fn wait(&self, duration: Duration);
}

/// Production timer on the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Timer that returns immediately, for tests that only care about attempt
/// counts and outcomes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimer;

#[async_trait]
impl Timer for NoopTimer {
    async fn wait(&self, _duration: Duration) {}
}

/// Timer that captures every requested wait instead of sleeping, so tests
/// can assert on the exact backoff schedule a policy produced.
#[derive(Debug, Clone, Default)]
pub struct RecordingTimer {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every wait requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.waits.lock().expect("RecordingTimer poisoned").clone()
    }

    pub fn clear(&self) {
        self.waits.lock().expect("RecordingTimer poisoned").clear();
    }
}

#[async_trait]
impl Timer for RecordingTimer {
    async fn wait(&self, duration: Duration) {
        self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}
