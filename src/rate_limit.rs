//! Rate limiting for outbound admission.
//!
//! Five algorithms behind one non-blocking `admit` call: token bucket, leaky
//! bucket, fixed window, sliding window (two adjacent fixed windows), and
//! adaptive (a token bucket whose rate expands on sustained success and
//! contracts on errors, bounded by `[min_rate, max_rate]`).
//!
//! `admit` is O(1) and never waits; a denial carries the suggested wait so
//! callers can surface `Retry-After`-style hints. Rejected requests are not
//! queued.

use crate::adaptive::Adaptive;
use crate::clock::Clock;
use crate::config::{RateLimitConfig, RateLimitKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ceiling on the denial wait hint.
const MAX_WAIT_HINT_S: f64 = 3_600.0;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed {
        /// Approximate permits left after this admission.
        remaining: f64,
    },
    Denied {
        /// How long the caller should wait before retrying.
        wait: Duration,
        reason: String,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Debug)]
enum State {
    TokenBucket { tokens: f64, last_refill_ms: u64 },
    LeakyBucket { level: f64, last_drain_ms: u64 },
    FixedWindow { window_start_ms: u64, count: u64 },
    SlidingWindow { window_start_ms: u64, current: u64, previous: u64 },
}

#[derive(Debug, Default)]
struct Feedback {
    samples: u64,
    errors: u64,
}

/// Non-blocking rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    /// Live rate; only the adaptive algorithm moves it.
    rate: Adaptive<f64>,
    feedback: Mutex<Feedback>,
    last_adjustment_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let state = match config.algorithm {
            RateLimitKind::TokenBucket | RateLimitKind::Adaptive => {
                State::TokenBucket { tokens: config.burst, last_refill_ms: now }
            }
            RateLimitKind::LeakyBucket => State::LeakyBucket { level: 0.0, last_drain_ms: now },
            RateLimitKind::FixedWindow => State::FixedWindow { window_start_ms: now, count: 0 },
            RateLimitKind::SlidingWindow => {
                State::SlidingWindow { window_start_ms: now, current: 0, previous: 0 }
            }
        };
        let rate = Adaptive::new(config.rps);
        Self {
            config,
            clock,
            state: Mutex::new(state),
            rate,
            feedback: Mutex::new(Feedback::default()),
            last_adjustment_ms: AtomicU64::new(now),
        }
    }

    /// Current effective rate in permits per second.
    pub fn current_rate(&self) -> f64 {
        *self.rate.get()
    }

    /// Admission check at the limiter's clock.
    pub fn admit(&self) -> Decision {
        self.admit_at(self.clock.now_millis())
    }

    /// Admission check at an explicit timestamp. Non-blocking, O(1).
    pub fn admit_at(&self, now_ms: u64) -> Decision {
        let rate = *self.rate.get();
        let mut state = self.state.lock().expect("RateLimiter poisoned");
        match &mut *state {
            State::TokenBucket { tokens, last_refill_ms } => {
                let elapsed = now_ms.saturating_sub(*last_refill_ms) as f64 / 1_000.0;
                *tokens = (*tokens + elapsed * rate).min(self.config.burst.max(1.0));
                *last_refill_ms = now_ms;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Decision::Allowed { remaining: *tokens }
                } else {
                    let wait_s = (1.0 - *tokens) / rate.max(f64::MIN_POSITIVE);
                    Decision::Denied {
                        wait: Duration::from_secs_f64(wait_s.min(MAX_WAIT_HINT_S)),
                        reason: "token_bucket_empty".into(),
                    }
                }
            }
            State::LeakyBucket { level, last_drain_ms } => {
                let elapsed = now_ms.saturating_sub(*last_drain_ms) as f64 / 1_000.0;
                *level = (*level - elapsed * rate).max(0.0);
                *last_drain_ms = now_ms;
                let capacity = self.config.burst.max(1.0);
                if *level + 1.0 <= capacity {
                    *level += 1.0;
                    Decision::Allowed { remaining: capacity - *level }
                } else {
                    let wait_s = (*level + 1.0 - capacity) / rate.max(f64::MIN_POSITIVE);
                    Decision::Denied {
                        wait: Duration::from_secs_f64(wait_s.min(MAX_WAIT_HINT_S)),
                        reason: "leaky_bucket_full".into(),
                    }
                }
            }
            State::FixedWindow { window_start_ms, count } => {
                let window = self.config.window_ms;
                if now_ms.saturating_sub(*window_start_ms) >= window {
                    *window_start_ms = now_ms - now_ms % window;
                    *count = 0;
                }
                let limit = self.window_limit(rate);
                if *count < limit {
                    *count += 1;
                    Decision::Allowed { remaining: (limit - *count) as f64 }
                } else {
                    let wait = window - now_ms.saturating_sub(*window_start_ms);
                    Decision::Denied {
                        wait: Duration::from_millis(wait),
                        reason: "fixed_window_exhausted".into(),
                    }
                }
            }
            State::SlidingWindow { window_start_ms, current, previous } => {
                let window = self.config.window_ms;
                let elapsed = now_ms.saturating_sub(*window_start_ms);
                if elapsed >= 2 * window {
                    *window_start_ms = now_ms - now_ms % window;
                    *previous = 0;
                    *current = 0;
                } else if elapsed >= window {
                    *window_start_ms += window;
                    *previous = *current;
                    *current = 0;
                }
                let into_window =
                    now_ms.saturating_sub(*window_start_ms) as f64 / window as f64;
                let weighted = *previous as f64 * (1.0 - into_window) + *current as f64;
                let limit = self.window_limit(rate) as f64;
                if weighted + 1.0 <= limit {
                    *current += 1;
                    Decision::Allowed { remaining: limit - weighted - 1.0 }
                } else {
                    let wait = window - now_ms.saturating_sub(*window_start_ms);
                    Decision::Denied {
                        wait: Duration::from_millis(wait),
                        reason: "sliding_window_exhausted".into(),
                    }
                }
            }
        }
    }

    fn window_limit(&self, rate: f64) -> u64 {
        ((rate * self.config.window_ms as f64 / 1_000.0).floor() as u64).max(1)
    }

    /// Feed an attempt outcome back. Only the adaptive algorithm reacts:
    /// after `cooldown` with ≥ 50 samples, sustained success expands the rate
    /// by `scale_factor`; any errors contract it by `2·scale_factor`.
    pub fn record_outcome(&self, success: bool) {
        if self.config.algorithm != RateLimitKind::Adaptive {
            return;
        }
        let now = self.clock.now_millis();
        let mut feedback = self.feedback.lock().expect("RateLimiter poisoned");
        feedback.samples += 1;
        if !success {
            feedback.errors += 1;
        }

        let last = self.last_adjustment_ms.load(Ordering::Acquire);
        let cooldown_ms = self.config.cooldown_s * 1_000;
        if now.saturating_sub(last) < cooldown_ms || feedback.samples < 50 {
            return;
        }

        let current = *self.rate.get();
        let next = if feedback.errors == 0 {
            current + self.config.scale_factor
        } else {
            current - 2.0 * self.config.scale_factor
        }
        .clamp(self.config.min_rate, self.config.max_rate);

        if (next - current).abs() > f64::EPSILON {
            tracing::debug!(from = current, to = next, errors = feedback.errors, "rate adjusted");
            self.rate.set(next);
        }
        *feedback = Feedback::default();
        self.last_adjustment_ms.store(now, Ordering::Release);
    }
}
