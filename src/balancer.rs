//! Health-aware load balancing with per-instance connection pools.
//!
//! The balancer keeps runtime state per instance id: lease count, local
//! instance state, rolling health score, latency histogram, and consecutive
//! check counters. Picks consider only Active instances with a health score
//! of at least 0.5; lease acquisition is non-blocking and exhaustion moves
//! on to the next candidate. Three consecutive failures mark an instance
//! Failed; two consecutive successes restore it. Draining refuses new
//! leases, waits for in-flight ones, then parks the instance Inactive.

use crate::config::{BalancerConfig, BalancerKind};
use crate::discovery::{Instance, InstanceState};
use crate::metrics::MetricsSink;
use hdrhistogram::Histogram;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// EWMA weight of the newest outcome in the health score.
const SCORE_ALPHA: f64 = 0.3;
/// Added to p95 latency when computing response-time weights.
const WEIGHT_EPSILON_MS: f64 = 1.0;

const POOL_ACTIVE: u8 = 0;
const POOL_DRAINING: u8 = 1;
const POOL_INACTIVE: u8 = 2;
const POOL_FAILED: u8 = 3;

fn pool_state_to_instance(state: u8) -> InstanceState {
    match state {
        POOL_DRAINING => InstanceState::Draining,
        POOL_INACTIVE => InstanceState::Inactive,
        POOL_FAILED => InstanceState::Failed,
        _ => InstanceState::Active,
    }
}

#[derive(Debug)]
struct InstancePool {
    id: String,
    limit: u32,
    leases: AtomicU32,
    state: AtomicU8,
    score_bits: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    latency: Mutex<Histogram<u64>>,
    drained: Notify,
}

impl InstancePool {
    fn new(id: String, limit: u32) -> Self {
        let mut latency = Histogram::new(2).unwrap_or_else(|_| {
            Histogram::new_with_bounds(1, 3_600_000, 2).expect("static histogram bounds")
        });
        latency.auto(true);
        Self {
            id,
            limit,
            leases: AtomicU32::new(0),
            state: AtomicU8::new(POOL_ACTIVE),
            score_bits: AtomicU64::new(1.0f64.to_bits()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            latency: Mutex::new(latency),
            drained: Notify::new(),
        }
    }

    fn score(&self) -> f64 {
        f64::from_bits(self.score_bits.load(Ordering::Acquire))
    }

    fn set_score(&self, score: f64) {
        self.score_bits.store(score.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    fn p95_ms(&self) -> f64 {
        let latency = self.latency.lock().expect("pool latency poisoned");
        if latency.is_empty() {
            0.0
        } else {
            latency.value_at_quantile(0.95) as f64
        }
    }

    /// Non-blocking lease; only Active instances lease.
    fn try_lease(self: &Arc<Self>) -> Option<Lease> {
        if self.state.load(Ordering::Acquire) != POOL_ACTIVE {
            return None;
        }
        loop {
            let current = self.leases.load(Ordering::Acquire);
            if current >= self.limit {
                return None;
            }
            if self
                .leases
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Lease { pool: self.clone(), released: false });
            }
        }
    }

    fn release(&self) {
        let remaining = self.leases.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.state.load(Ordering::Acquire) == POOL_DRAINING {
            self.drained.notify_waiters();
        }
    }
}

/// RAII connection lease. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<InstancePool>,
    released: bool,
}

impl Lease {
    pub fn instance_id(&self) -> &str {
        &self.pool.id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Instance selection plus pool bookkeeping.
pub struct LoadBalancer {
    config: BalancerConfig,
    sink: Arc<dyn MetricsSink>,
    pools: RwLock<HashMap<String, Arc<InstancePool>>>,
    rr: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink, pools: RwLock::new(HashMap::new()), rr: AtomicUsize::new(0) }
    }

    fn pool_for(&self, instance: &Instance) -> Arc<InstancePool> {
        if let Some(pool) = self.pools.read().expect("LoadBalancer poisoned").get(&instance.id) {
            return pool.clone();
        }
        let mut pools = self.pools.write().expect("LoadBalancer poisoned");
        pools
            .entry(instance.id.clone())
            .or_insert_with(|| {
                Arc::new(InstancePool::new(instance.id.clone(), self.config.connection_limit))
            })
            .clone()
    }

    /// Local (balancer-side) view of an instance's state.
    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.pools
            .read()
            .expect("LoadBalancer poisoned")
            .get(instance_id)
            .map(|pool| pool_state_to_instance(pool.state.load(Ordering::Acquire)))
    }

    /// Current leases held against an instance.
    pub fn leases(&self, instance_id: &str) -> u32 {
        self.pools
            .read()
            .expect("LoadBalancer poisoned")
            .get(instance_id)
            .map(|pool| pool.leases.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Rolling health score for an instance.
    pub fn health_score(&self, instance_id: &str) -> f64 {
        self.pools
            .read()
            .expect("LoadBalancer poisoned")
            .get(instance_id)
            .map(|pool| pool.score())
            .unwrap_or(1.0)
    }

    /// Pick an instance and take a lease. `None` when no candidate is
    /// Active, scoring ≥ 0.5, and below its connection limit.
    pub fn pick(&self, instances: &[Instance]) -> Option<(Instance, Lease)> {
        let mut candidates: Vec<(usize, Arc<InstancePool>)> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state == InstanceState::Active)
            .map(|(idx, i)| (idx, self.pool_for(i)))
            .filter(|(_, pool)| {
                pool.state.load(Ordering::Acquire) == POOL_ACTIVE
                    && pool.score() >= self.config.min_health_score
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        self.order_candidates(&mut candidates);

        for (idx, pool) in candidates {
            if let Some(lease) = pool.try_lease() {
                return Some((instances[idx].clone(), lease));
            }
        }
        None
    }

    fn order_candidates(&self, candidates: &mut Vec<(usize, Arc<InstancePool>)>) {
        let mut rng = rand::rng();
        match self.config.strategy {
            BalancerKind::RoundRobin => {
                let start = self.rr.fetch_add(1, Ordering::AcqRel) % candidates.len();
                candidates.rotate_left(start);
            }
            BalancerKind::LeastConnections => {
                candidates.sort_by_key(|(_, pool)| pool.leases.load(Ordering::Acquire));
            }
            BalancerKind::Random => {
                candidates.shuffle(&mut rng);
            }
            BalancerKind::ResponseTimeWeighted => {
                weighted_front(candidates, &mut rng, |pool| {
                    1.0 / (pool.p95_ms() + WEIGHT_EPSILON_MS)
                });
            }
            BalancerKind::HealthScoreWeighted => {
                weighted_front(candidates, &mut rng, |pool| pool.score());
            }
        }
    }

    /// Record an attempt outcome against the instance that served it.
    pub fn record_outcome(&self, instance_id: &str, latency: Duration, success: bool) {
        let pool = {
            let pools = self.pools.read().expect("LoadBalancer poisoned");
            match pools.get(instance_id) {
                Some(pool) => pool.clone(),
                None => return,
            }
        };
        pool.latency
            .lock()
            .expect("pool latency poisoned")
            .saturating_record(latency.as_millis().max(1) as u64);
        self.apply_evidence(&pool, instance_id, success);
    }

    /// Record a health-check result from the background check loop. Checks
    /// feed the same consecutive counters and score as real traffic, but
    /// not the latency histogram.
    pub fn record_check(&self, instance_id: &str, healthy: bool) {
        let pool = {
            let pools = self.pools.read().expect("LoadBalancer poisoned");
            match pools.get(instance_id) {
                Some(pool) => pool.clone(),
                None => return,
            }
        };
        self.apply_evidence(&pool, instance_id, healthy);
    }

    fn apply_evidence(&self, pool: &Arc<InstancePool>, instance_id: &str, success: bool) {
        pool.set_score((1.0 - SCORE_ALPHA) * pool.score() + SCORE_ALPHA * f64::from(success as u8));

        if success {
            pool.consecutive_failures.store(0, Ordering::Release);
            let streak = pool.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if streak >= self.config.restore_after
                && pool
                    .state
                    .compare_exchange(POOL_FAILED, POOL_ACTIVE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::info!(instance = instance_id, "instance restored");
                self.sink.event("instance_restored", &[("instance", instance_id)]);
            }
        } else {
            pool.consecutive_successes.store(0, Ordering::Release);
            let streak = pool.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if streak >= self.config.fail_after
                && pool
                    .state
                    .compare_exchange(POOL_ACTIVE, POOL_FAILED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::warn!(instance = instance_id, failures = streak, "instance failed");
                self.sink.event("instance_failed", &[("instance", instance_id)]);
            }
        }
    }

    /// Gracefully drain an instance: refuse new leases, wait for in-flight
    /// ones (bounded by `timeout`), then mark Inactive. Returns `true` when
    /// every lease was returned in time.
    pub async fn drain(&self, instance_id: &str, timeout: Duration) -> bool {
        let pool = {
            let pools = self.pools.read().expect("LoadBalancer poisoned");
            match pools.get(instance_id) {
                Some(pool) => pool.clone(),
                None => return true,
            }
        };

        pool.state.store(POOL_DRAINING, Ordering::Release);
        tracing::info!(instance = instance_id, "draining");
        self.sink.event("instance_draining", &[("instance", instance_id)]);

        let deadline = tokio::time::Instant::now() + timeout;
        let fully_drained = loop {
            if pool.leases.load(Ordering::Acquire) == 0 {
                break true;
            }
            let notified = pool.drained.notified();
            if pool.leases.load(Ordering::Acquire) == 0 {
                break true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => break false,
            }
        };

        pool.state.store(POOL_INACTIVE, Ordering::Release);
        tracing::info!(instance = instance_id, fully_drained, "drained to inactive");
        self.sink.event("instance_inactive", &[("instance", instance_id)]);
        fully_drained
    }

    /// Default drain timeout from configuration.
    pub fn drain_timeout(&self) -> Duration {
        self.config.drain_timeout()
    }
}

/// Move a weighted-random choice to the front, rest sorted by weight.
fn weighted_front<R: Rng>(
    candidates: &mut Vec<(usize, Arc<InstancePool>)>,
    rng: &mut R,
    weight: impl Fn(&InstancePool) -> f64,
) {
    let weights: Vec<f64> = candidates.iter().map(|(_, pool)| weight(pool).max(0.0)).collect();
    let total: f64 = weights.iter().sum();
    candidates.sort_by(|a, b| {
        weight(&b.1).partial_cmp(&weight(&a.1)).unwrap_or(std::cmp::Ordering::Equal)
    });
    if total <= 0.0 {
        return;
    }
    let mut roll = rng.random_range(0.0..total);
    for i in 0..candidates.len() {
        let w = weight(&candidates[i].1);
        if roll < w {
            candidates.swap(0, i);
            return;
        }
        roll -= w;
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;

    fn balancer(strategy: BalancerKind, limit: u32) -> LoadBalancer {
        LoadBalancer::new(
            BalancerConfig {
                strategy,
                connection_limit: limit,
                drain_timeout_ms: 1_000,
                ..BalancerConfig::default()
            },
            Arc::new(MemorySink::new()),
        )
    }

    fn instances(n: usize) -> Vec<Instance> {
        (0..n).map(|i| Instance::new(format!("i-{i}"), "svc", "10.0.0.1", 8000 + i as u16)).collect()
    }

    #[test]
    fn round_robin_cycles_through_instances() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (instance, lease) = lb.pick(&instances).unwrap();
            seen.push(instance.id.clone());
            lease.release();
        }
        seen.sort();
        assert_eq!(seen, vec!["i-0", "i-1", "i-2"], "each instance picked once");
    }

    #[test]
    fn lease_counts_respect_the_connection_limit() {
        let lb = balancer(BalancerKind::RoundRobin, 2);
        let instances = instances(1);

        let a = lb.pick(&instances).unwrap();
        let b = lb.pick(&instances).unwrap();
        assert!(lb.pick(&instances).is_none(), "limit reached");
        assert_eq!(lb.leases("i-0"), 2);

        drop(a);
        assert_eq!(lb.leases("i-0"), 1);
        let _c = lb.pick(&instances).unwrap();
        drop(b);
    }

    #[test]
    fn exhausted_instance_is_skipped_for_the_next_candidate() {
        let lb = balancer(BalancerKind::LeastConnections, 1);
        let instances = instances(2);

        let first = lb.pick(&instances).unwrap();
        let (second, _lease) = lb.pick(&instances).unwrap();
        assert_ne!(first.0.id, second.id);
        assert!(lb.pick(&instances).is_none());
    }

    #[test]
    fn low_scoring_instances_are_not_picked() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(2);

        // Push i-0 below the pick threshold.
        for _ in 0..10 {
            lb.record_outcome("i-0", Duration::from_millis(10), false);
        }
        assert!(lb.health_score("i-0") < 0.5);

        for _ in 0..5 {
            let (instance, lease) = lb.pick(&instances).unwrap();
            assert_eq!(instance.id, "i-1");
            lease.release();
        }
    }

    #[test]
    fn three_consecutive_failures_mark_failed_two_successes_restore() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(1);
        lb.pick(&instances).unwrap();

        for _ in 0..3 {
            lb.record_outcome("i-0", Duration::from_millis(10), false);
        }
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Failed));
        assert!(lb.pick(&instances).is_none(), "failed instances take no traffic");

        for _ in 0..2 {
            lb.record_outcome("i-0", Duration::from_millis(10), true);
        }
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Active));
        // Score also recovered enough to pick again after successes.
        for _ in 0..10 {
            lb.record_outcome("i-0", Duration::from_millis(10), true);
        }
        assert!(lb.pick(&instances).is_some());
    }

    #[test]
    fn least_connections_prefers_the_idle_instance() {
        let lb = balancer(BalancerKind::LeastConnections, 10);
        let instances = instances(2);

        let (_busy, _lease) = lb.pick(&instances).unwrap();
        let busy_id = _lease.instance_id().to_string();
        let (next, _lease2) = lb.pick(&instances).unwrap();
        assert_ne!(next.id, busy_id);
    }

    #[test]
    fn response_time_weighted_prefers_the_fast_instance() {
        let lb = balancer(BalancerKind::ResponseTimeWeighted, 10);
        let instances = instances(2);
        for _ in 0..50 {
            lb.record_outcome("i-0", Duration::from_millis(500), true);
            lb.record_outcome("i-1", Duration::from_millis(5), true);
        }

        let mut fast_picks = 0;
        for _ in 0..100 {
            let (instance, lease) = lb.pick(&instances).unwrap();
            if instance.id == "i-1" {
                fast_picks += 1;
            }
            lease.release();
        }
        assert!(fast_picks > 80, "fast instance picked {} of 100", fast_picks);
    }

    #[test]
    fn health_checks_restore_failed_instances() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(1);
        lb.pick(&instances).unwrap();

        for _ in 0..3 {
            lb.record_outcome("i-0", Duration::from_millis(10), false);
        }
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Failed));

        // Background checks pass; the instance comes back and its score
        // climbs above the pick threshold.
        for _ in 0..10 {
            lb.record_check("i-0", true);
        }
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Active));
        assert!(lb.pick(&instances).is_some());
    }

    #[tokio::test]
    async fn drain_refuses_new_leases_and_waits_for_inflight() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(1);

        let (_, lease) = lb.pick(&instances).unwrap();
        let lb = Arc::new(lb);
        let drainer = lb.clone();
        let drain_task =
            tokio::spawn(async move { drainer.drain("i-0", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Draining));
        assert!(lb.pick(&instances).is_none(), "draining refuses new leases");

        lease.release();
        let fully = drain_task.await.unwrap();
        assert!(fully);
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Inactive));
    }

    #[tokio::test]
    async fn drain_times_out_but_still_goes_inactive() {
        let lb = balancer(BalancerKind::RoundRobin, 10);
        let instances = instances(1);
        let (_, _lease) = lb.pick(&instances).unwrap();

        let fully = lb.drain("i-0", Duration::from_millis(30)).await;
        assert!(!fully);
        assert_eq!(lb.instance_state("i-0"), Some(InstanceState::Inactive));
    }
}
