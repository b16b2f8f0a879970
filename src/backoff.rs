//! Backoff strategies for the retry engine.
//!
//! Six strategies, selectable per session: exponential, fibonacci,
//! decorrelated jitter, resource-sensitive (wraps another strategy),
//! pattern-based (autocorrelation over the session's outcome history), and
//! adaptive (ε-greedy selection among the basic strategies by effectiveness).
//!
//! Invalid inputs (attempt 0, non-finite utilization) never error; they
//! yield the strategy's base delay and bump the session's fault count.

use crate::config::{BackoffConfig, BackoffKind, RetryConfig};
use rand::Rng;
use std::time::Duration;

#[cfg(test)]
use rand::{rngs::StdRng, SeedableRng};

/// Outcome of one attempt, as seen by the backoff engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptOutcome {
    pub success: bool,
    pub latency: Duration,
    /// Timestamp in milliseconds on the session's clock.
    pub at_millis: u64,
}

/// Per-call context handed to `next_delay`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffContext {
    /// Observed resource utilization in `[0, 1]`.
    pub utilization: f64,
}

/// Minimum outcomes before pattern detection activates.
const PATTERN_MIN_OUTCOMES: usize = 5;
/// Normalized autocorrelation below this means "no repeating pattern".
const PATTERN_MIN_CORRELATION: f64 = 0.5;
/// Cap on stored outcomes per session.
const MAX_SESSION_OUTCOMES: usize = 64;

/// Candidate pool the adaptive strategy picks from.
const ADAPTIVE_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
struct StrategyStats {
    attempts: u64,
    successes: u64,
    latency_sum_ms: u64,
    latency_max_ms: u64,
}

impl StrategyStats {
    /// Effectiveness `S = success_rate · (1 − normalized_latency)`, where
    /// latency is normalized against the slowest observation across the
    /// whole candidate pool.
    fn score(&self, global_max_latency_ms: u64) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        let success_rate = self.successes as f64 / self.attempts as f64;
        let normalized_latency = if global_max_latency_ms == 0 {
            0.0
        } else {
            (self.latency_sum_ms as f64 / self.attempts as f64) / global_max_latency_ms as f64
        };
        success_rate * (1.0 - normalized_latency.min(1.0))
    }
}

/// Mutable per-call-sequence state: previous delay, outcome history, and
/// adaptive strategy statistics.
#[derive(Debug, Clone, Default)]
pub struct BackoffSession {
    previous_delay: Option<Duration>,
    outcomes: Vec<AttemptOutcome>,
    faults: u64,
    adaptive_stats: [StrategyStats; ADAPTIVE_CANDIDATES],
    last_pick: Option<usize>,
}

impl BackoffSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of the attempt whose delay this session computed
    /// last. Updates adaptive effectiveness scores.
    pub fn record_outcome(&mut self, outcome: AttemptOutcome) {
        if self.outcomes.len() >= MAX_SESSION_OUTCOMES {
            self.outcomes.remove(0);
        }
        self.outcomes.push(outcome);

        if let Some(pick) = self.last_pick {
            let stats = &mut self.adaptive_stats[pick];
            stats.attempts += 1;
            if outcome.success {
                stats.successes += 1;
            }
            let ms = outcome.latency.as_millis() as u64;
            stats.latency_sum_ms += ms;
            stats.latency_max_ms = stats.latency_max_ms.max(ms);
        }
    }

    pub fn outcomes(&self) -> &[AttemptOutcome] {
        &self.outcomes
    }

    /// Count of invalid-input faults absorbed by this session.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn previous_delay(&self) -> Option<Duration> {
        self.previous_delay
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// `delay = min(max, base · multiplier^(n−1))`
    Exponential { base: Duration, multiplier: f64, max: Duration },
    /// `delay = min(max, F(n) · base)`
    Fibonacci { base: Duration, max: Duration },
    /// `delay = min(max, Uniform(base, previous · 3))`, previous defaults to base
    DecorrelatedJitter { base: Duration, max: Duration },
    /// Inner strategy's delay scaled by `1 + k·max(0, util − threshold)`
    ResourceSensitive { inner: Box<Backoff>, threshold: f64, factor: f64 },
    /// Infers a repeating fail/success period from session history
    Pattern { base: Duration, max: Duration },
    /// ε-greedy pick among exponential/fibonacci/decorrelated by effectiveness
    Adaptive { base: Duration, max: Duration, multiplier: f64, epsilon: f64 },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential { base, multiplier: 2.0, max: Duration::from_secs(60) }
    }

    pub fn fibonacci(base: Duration) -> Self {
        Self::Fibonacci { base, max: Duration::from_secs(60) }
    }

    pub fn decorrelated(base: Duration) -> Self {
        Self::DecorrelatedJitter { base, max: Duration::from_secs(60) }
    }

    pub fn resource_sensitive(inner: Backoff) -> Self {
        Self::ResourceSensitive { inner: Box::new(inner), threshold: 0.7, factor: 2.0 }
    }

    pub fn pattern(base: Duration) -> Self {
        Self::Pattern { base, max: Duration::from_secs(60) }
    }

    pub fn adaptive(base: Duration) -> Self {
        Self::Adaptive { base, max: Duration::from_secs(60), multiplier: 2.0, epsilon: 0.1 }
    }

    /// Set the maximum delay cap.
    pub fn with_max(mut self, new_max: Duration) -> Self {
        match &mut self {
            Self::Exponential { max, .. }
            | Self::Fibonacci { max, .. }
            | Self::DecorrelatedJitter { max, .. }
            | Self::Pattern { max, .. }
            | Self::Adaptive { max, .. } => *max = new_max,
            Self::ResourceSensitive { inner, .. } => {
                **inner = (**inner).clone().with_max(new_max);
            }
        }
        self
    }

    /// Build from configuration.
    pub fn from_config(backoff: &BackoffConfig, retry: &RetryConfig) -> Self {
        let base = retry.initial_delay();
        let max = retry.max_delay();
        match backoff.strategy {
            BackoffKind::Exponential => {
                Self::Exponential { base, multiplier: retry.multiplier, max }
            }
            BackoffKind::Fibonacci => Self::Fibonacci { base, max },
            BackoffKind::DecorrelatedJitter => Self::DecorrelatedJitter { base, max },
            BackoffKind::ResourceSensitive => Self::ResourceSensitive {
                inner: Box::new(Self::Exponential { base, multiplier: retry.multiplier, max }),
                threshold: backoff.resource_threshold,
                factor: backoff.resource_factor,
            },
            BackoffKind::Pattern => Self::Pattern { base, max },
            BackoffKind::Adaptive => Self::Adaptive {
                base,
                max,
                multiplier: retry.multiplier,
                epsilon: backoff.epsilon,
            },
        }
    }

    /// The strategy's base delay, used as the fault fallback.
    pub fn base(&self) -> Duration {
        match self {
            Self::Exponential { base, .. }
            | Self::Fibonacci { base, .. }
            | Self::DecorrelatedJitter { base, .. }
            | Self::Pattern { base, .. }
            | Self::Adaptive { base, .. } => *base,
            Self::ResourceSensitive { inner, .. } => inner.base(),
        }
    }

    /// Compute the delay before attempt `attempt` (1-indexed).
    pub fn next_delay(
        &self,
        session: &mut BackoffSession,
        attempt: u32,
        ctx: &BackoffContext,
    ) -> Duration {
        let mut rng = rand::rng();
        self.next_delay_with_rng(session, attempt, ctx, &mut rng)
    }

    /// Like [`next_delay`](Self::next_delay) with a caller-supplied RNG for
    /// deterministic tests.
    pub fn next_delay_with_rng<R: Rng>(
        &self,
        session: &mut BackoffSession,
        attempt: u32,
        ctx: &BackoffContext,
        rng: &mut R,
    ) -> Duration {
        if attempt == 0 || !ctx.utilization.is_finite() {
            session.faults += 1;
            let delay = self.base();
            session.previous_delay = Some(delay);
            return delay;
        }

        let delay = match self {
            Self::Exponential { base, multiplier, max } => {
                exponential_delay(*base, *multiplier, attempt).min(*max)
            }
            Self::Fibonacci { base, max } => fibonacci_delay(*base, attempt).min(*max),
            Self::DecorrelatedJitter { base, max } => {
                let previous = session.previous_delay.unwrap_or(*base);
                decorrelated_delay(*base, previous, *max, rng)
            }
            Self::ResourceSensitive { inner, threshold, factor } => {
                let inner_delay = inner.next_delay_with_rng(session, attempt, ctx, rng);
                let overload = (ctx.utilization - threshold).max(0.0);
                inner_delay.mul_f64(1.0 + factor * overload)
            }
            Self::Pattern { base, max } => {
                pattern_delay(session.outcomes(), *base).unwrap_or(*base).min(*max)
            }
            Self::Adaptive { base, max, multiplier, epsilon } => {
                let pick = pick_adaptive(&session.adaptive_stats, *epsilon, rng);
                session.last_pick = Some(pick);
                let delay = match pick {
                    0 => exponential_delay(*base, *multiplier, attempt),
                    1 => fibonacci_delay(*base, attempt),
                    _ => {
                        let previous = session.previous_delay.unwrap_or(*base);
                        decorrelated_delay(*base, previous, *max, rng)
                    }
                };
                delay.min(*max)
            }
        };

        session.previous_delay = Some(delay);
        delay
    }
}

fn exponential_delay(base: Duration, multiplier: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let scale = multiplier.max(1.0).powi(exponent as i32);
    if !scale.is_finite() {
        return Duration::from_secs(u64::MAX / 1_000);
    }
    base.mul_f64(scale)
}

fn fibonacci_delay(base: Duration, attempt: u32) -> Duration {
    // F(1)=1, F(2)=1, then saturating.
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..attempt {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    let f = if attempt <= 1 { 1 } else { b };
    base.checked_mul(f.min(u32::MAX as u64) as u32).unwrap_or(Duration::from_secs(u64::MAX / 1_000))
}

fn decorrelated_delay<R: Rng>(
    base: Duration,
    previous: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let lo = base.as_millis() as u64;
    let hi = (previous.as_millis() as u64).saturating_mul(3).min(max.as_millis() as u64);
    if lo >= hi {
        return base.min(max);
    }
    Duration::from_millis(rng.random_range(lo..=hi))
}

/// Autocorrelate the session's fail/success series. Returns the inferred
/// period when a repeating pattern is present.
fn pattern_delay(outcomes: &[AttemptOutcome], base: Duration) -> Option<Duration> {
    if outcomes.len() < PATTERN_MIN_OUTCOMES {
        return None;
    }

    let series: Vec<f64> = outcomes.iter().map(|o| if o.success { 1.0 } else { -1.0 }).collect();
    let n = series.len();

    let mut best_lag = 0usize;
    let mut best_corr = 0.0f64;
    for lag in 1..=n / 2 {
        let overlap = n - lag;
        let dot: f64 = (0..overlap).map(|i| series[i] * series[i + lag]).sum();
        let corr = dot / overlap as f64;
        if corr > best_corr {
            best_corr = corr;
            best_lag = lag;
        }
    }

    if best_corr < PATTERN_MIN_CORRELATION || best_lag == 0 {
        return None;
    }

    // Period in wall time: lag × mean spacing between observed attempts.
    let first = outcomes.first()?.at_millis;
    let last = outcomes.last()?.at_millis;
    let span = last.saturating_sub(first);
    if span == 0 {
        return None;
    }
    let mean_interval = span / (n as u64 - 1).max(1);
    let period = Duration::from_millis(best_lag as u64 * mean_interval);
    Some(period.max(base))
}

fn pick_adaptive<R: Rng>(stats: &[StrategyStats; ADAPTIVE_CANDIDATES], epsilon: f64, rng: &mut R) -> usize {
    if rng.random_range(0.0..1.0) < epsilon {
        return rng.random_range(0..ADAPTIVE_CANDIDATES);
    }
    // Sample every candidate once before exploiting.
    if let Some(unexplored) = stats.iter().position(|s| s.attempts == 0) {
        return unexplored;
    }
    let global_max = stats.iter().map(|s| s.latency_max_ms).max().unwrap_or(0);
    let mut best = 0;
    let mut best_score = f64::MIN;
    for (i, s) in stats.iter().enumerate() {
        let score = s.score(global_max);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    fn ctx() -> BackoffContext {
        BackoffContext { utilization: 0.0 }
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        let mut session = BackoffSession::new();
        assert_eq!(backoff.next_delay(&mut session, 1, &ctx()), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(&mut session, 2, &ctx()), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(&mut session, 3, &ctx()), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(&mut session, 10, &ctx()), Duration::from_secs(1));
    }

    #[test]
    fn exponential_is_monotone_until_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(50));
        let mut session = BackoffSession::new();
        let mut prev = Duration::ZERO;
        for attempt in 1..=12 {
            let d = backoff.next_delay(&mut session, attempt, &ctx());
            assert!(d >= prev, "attempt {}: {:?} < {:?}", attempt, d, prev);
            prev = d;
        }
    }

    #[test]
    fn fibonacci_follows_the_sequence() {
        let backoff =
            Backoff::Fibonacci { base: Duration::from_millis(10), max: Duration::from_secs(10) };
        let mut session = BackoffSession::new();
        let delays: Vec<u64> = (1..=6)
            .map(|n| backoff.next_delay(&mut session, n, &ctx()).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 80]);
    }

    #[test]
    fn decorrelated_stays_within_bounds() {
        let backoff = Backoff::DecorrelatedJitter {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        };
        let mut session = BackoffSession::new();
        let mut rng = seeded_rng(7);
        for attempt in 1..=50 {
            let d = backoff.next_delay_with_rng(&mut session, attempt, &ctx(), &mut rng);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn resource_sensitive_scales_under_load() {
        let inner = Backoff::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        };
        let backoff = Backoff::ResourceSensitive {
            inner: Box::new(inner),
            threshold: 0.7,
            factor: 2.0,
        };
        let mut session = BackoffSession::new();

        let idle = backoff.next_delay(&mut session, 1, &BackoffContext { utilization: 0.5 });
        assert_eq!(idle, Duration::from_millis(100));

        // util 0.9 → 1 + 2·0.2 = 1.4×
        let loaded = backoff.next_delay(&mut session, 1, &BackoffContext { utilization: 0.9 });
        assert_eq!(loaded, Duration::from_millis(140));
    }

    #[test]
    fn pattern_needs_five_outcomes() {
        let backoff =
            Backoff::Pattern { base: Duration::from_millis(100), max: Duration::from_secs(60) };
        let mut session = BackoffSession::new();
        for i in 0..4 {
            session.record_outcome(AttemptOutcome {
                success: i % 2 == 0,
                latency: Duration::from_millis(10),
                at_millis: i * 1_000,
            });
        }
        assert_eq!(backoff.next_delay(&mut session, 5, &ctx()), Duration::from_millis(100));
    }

    #[test]
    fn pattern_detects_alternating_outcomes() {
        let backoff =
            Backoff::Pattern { base: Duration::from_millis(100), max: Duration::from_secs(60) };
        let mut session = BackoffSession::new();
        // Strict fail/success alternation at 1 s spacing → period 2 s.
        for i in 0..10u64 {
            session.record_outcome(AttemptOutcome {
                success: i % 2 == 0,
                latency: Duration::from_millis(10),
                at_millis: i * 1_000,
            });
        }
        let delay = backoff.next_delay(&mut session, 11, &ctx());
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn invalid_inputs_fall_back_to_base_and_count_faults() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        let mut session = BackoffSession::new();

        let d = backoff.next_delay(&mut session, 0, &ctx());
        assert_eq!(d, Duration::from_millis(100));
        assert_eq!(session.faults(), 1);

        let d = backoff.next_delay(&mut session, 3, &BackoffContext { utilization: f64::NAN });
        assert_eq!(d, Duration::from_millis(100));
        assert_eq!(session.faults(), 2);
    }

    #[test]
    fn adaptive_prefers_the_scoring_strategy() {
        let backoff = Backoff::Adaptive {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            epsilon: 0.0,
        };
        let mut session = BackoffSession::new();
        let mut rng = seeded_rng(42);

        // Drive every candidate once, then reward whichever was picked last
        // with fast successes and verify the pick becomes stable.
        for attempt in 1..=3 {
            backoff.next_delay_with_rng(&mut session, attempt, &ctx(), &mut rng);
            session.record_outcome(AttemptOutcome {
                success: attempt == 3,
                latency: Duration::from_millis(if attempt == 3 { 5 } else { 500 }),
                at_millis: attempt as u64 * 100,
            });
        }
        let stable_pick = session.last_pick;
        for attempt in 4..=8 {
            backoff.next_delay_with_rng(&mut session, attempt, &ctx(), &mut rng);
            assert_eq!(session.last_pick, stable_pick);
            session.record_outcome(AttemptOutcome {
                success: true,
                latency: Duration::from_millis(5),
                at_millis: attempt as u64 * 100,
            });
        }
    }

    #[test]
    fn session_history_is_bounded() {
        let mut session = BackoffSession::new();
        for i in 0..200u64 {
            session.record_outcome(AttemptOutcome {
                success: true,
                latency: Duration::from_millis(1),
                at_millis: i,
            });
        }
        assert!(session.outcomes().len() <= 64);
    }

    #[test]
    fn from_config_respects_strategy_kind() {
        let retry = RetryConfig::default();
        let mut cfg = BackoffConfig::default();
        cfg.strategy = BackoffKind::Fibonacci;
        assert!(matches!(Backoff::from_config(&cfg, &retry), Backoff::Fibonacci { .. }));

        cfg.strategy = BackoffKind::ResourceSensitive;
        assert!(matches!(Backoff::from_config(&cfg, &retry), Backoff::ResourceSensitive { .. }));
    }
}
