//! Typed service dependency graph with bounded status propagation.
//!
//! Nodes live in an arena indexed by service id; edges are stored as
//! `(from, to, kind, impact)` with forward and reverse adjacency lists.
//! Propagation walks reverse edges breadth-first with a visited bitset, so
//! one status change costs O(V+E) even when the graph has cycles.
//!
//! Edge semantics on a failing dependency:
//! - `Critical`: dependents become at least Degraded immediately; once the
//!   dependency has been Unhealthy longer than the cascade delay, dependents
//!   become Unhealthy too.
//! - `Required`: dependents become Degraded.
//! - `Optional` / `Fallback`: no status change, recorded for audit.

use crate::clock::Clock;
use crate::health::HealthStatus;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How strongly a service depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Critical,
    Required,
    Optional,
    Fallback,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Required => "required",
            Self::Optional => "optional",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    service: String,
    status: HealthStatus,
    status_since_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    from: usize,
    to: usize,
    kind: DependencyKind,
    impact: f64,
    live: bool,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Edge indices by `from` node.
    forward: Vec<Vec<usize>>,
    /// Edge indices by `to` node.
    reverse: Vec<Vec<usize>>,
}

impl Graph {
    fn node(&mut self, service: &str, now: u64) -> usize {
        if let Some(&idx) = self.index.get(service) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            service: service.to_string(),
            status: HealthStatus::Unknown,
            status_since_ms: now,
        });
        self.forward.push(Vec::new());
        self.reverse.push(Vec::new());
        self.index.insert(service.to_string(), idx);
        idx
    }
}

/// One observed effect of a propagation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationEffect {
    pub service: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    /// The dependency whose change triggered this effect.
    pub via: String,
    pub kind: DependencyKind,
}

/// Shared dependency graph; many readers, infrequent writers.
#[derive(Debug)]
pub struct DependencyChain {
    graph: RwLock<Graph>,
    clock: Arc<dyn Clock>,
    cascade_delay: Duration,
}

impl DependencyChain {
    pub fn new(clock: Arc<dyn Clock>, cascade_delay: Duration) -> Self {
        Self { graph: RwLock::new(Graph::default()), clock, cascade_delay }
    }

    /// Add or replace the edge `from → to`. Impact is clamped to `[0, 1]`.
    pub fn add(&self, from: &str, to: &str, kind: DependencyKind, impact: f64) {
        let now = self.clock.now_millis();
        let mut graph = self.graph.write().expect("DependencyChain poisoned");
        let from_idx = graph.node(from, now);
        let to_idx = graph.node(to, now);

        let existing = graph.forward[from_idx]
            .iter()
            .copied()
            .find(|&e| graph.edges[e].live && graph.edges[e].to == to_idx);
        if let Some(edge_idx) = existing {
            graph.edges[edge_idx].kind = kind;
            graph.edges[edge_idx].impact = impact.clamp(0.0, 1.0);
            return;
        }

        let edge_idx = graph.edges.len();
        graph.edges.push(Edge {
            from: from_idx,
            to: to_idx,
            kind,
            impact: impact.clamp(0.0, 1.0),
            live: true,
        });
        graph.forward[from_idx].push(edge_idx);
        graph.reverse[to_idx].push(edge_idx);
    }

    /// Remove the edge `from → to` if present.
    pub fn remove(&self, from: &str, to: &str) {
        let mut graph = self.graph.write().expect("DependencyChain poisoned");
        let (Some(&from_idx), Some(&to_idx)) = (graph.index.get(from), graph.index.get(to))
        else {
            return;
        };
        for i in 0..graph.edges.len() {
            let e = graph.edges[i];
            if e.live && e.from == from_idx && e.to == to_idx {
                graph.edges[i].live = false;
            }
        }
        let Graph { edges, forward, reverse, .. } = &mut *graph;
        forward[from_idx].retain(|&e| edges[e].live);
        reverse[to_idx].retain(|&e| edges[e].live);
    }

    /// Current status of a service node; Unknown for unregistered services.
    pub fn health_of(&self, service: &str) -> HealthStatus {
        let graph = self.graph.read().expect("DependencyChain poisoned");
        graph
            .index
            .get(service)
            .map(|&idx| graph.nodes[idx].status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Set a node's status without propagating.
    pub fn set_status(&self, service: &str, status: HealthStatus) {
        let now = self.clock.now_millis();
        let mut graph = self.graph.write().expect("DependencyChain poisoned");
        let idx = graph.node(service, now);
        if graph.nodes[idx].status != status {
            graph.nodes[idx].status = status;
            graph.nodes[idx].status_since_ms = now;
        }
    }

    /// What `service` depends on: `(dependency, kind, dependency status)`.
    pub fn dependencies_of(&self, service: &str) -> Vec<(String, DependencyKind, HealthStatus)> {
        let graph = self.graph.read().expect("DependencyChain poisoned");
        let Some(&idx) = graph.index.get(service) else {
            return Vec::new();
        };
        graph.forward[idx]
            .iter()
            .filter(|&&e| graph.edges[e].live)
            .map(|&e| {
                let edge = graph.edges[e];
                let dep = &graph.nodes[edge.to];
                (dep.service.clone(), edge.kind, dep.status)
            })
            .collect()
    }

    /// Who depends on `service`.
    pub fn dependents_of(&self, service: &str) -> Vec<(String, DependencyKind)> {
        let graph = self.graph.read().expect("DependencyChain poisoned");
        let Some(&idx) = graph.index.get(service) else {
            return Vec::new();
        };
        graph.reverse[idx]
            .iter()
            .filter(|&&e| graph.edges[e].live)
            .map(|&e| {
                let edge = graph.edges[e];
                (graph.nodes[edge.from].service.clone(), edge.kind)
            })
            .collect()
    }

    /// Record `service`'s new status and walk dependents. Returns every
    /// effect, including audit-only records for Optional/Fallback edges.
    pub fn propagate(&self, service: &str, status: HealthStatus) -> Vec<PropagationEffect> {
        let now = self.clock.now_millis();
        let cascade_ms = self.cascade_delay.as_millis() as u64;
        let mut graph = self.graph.write().expect("DependencyChain poisoned");
        let start = graph.node(service, now);
        if graph.nodes[start].status != status {
            graph.nodes[start].status = status;
            graph.nodes[start].status_since_ms = now;
        }

        let mut effects = Vec::new();
        let mut visited = vec![false; graph.nodes.len()];
        let mut queue = VecDeque::new();
        visited[start] = true;
        queue.push_back(start);

        while let Some(failing) = queue.pop_front() {
            let failing_status = graph.nodes[failing].status;
            let failing_since = graph.nodes[failing].status_since_ms;
            if failing_status.severity() < HealthStatus::Degraded.severity() {
                continue;
            }
            let unhealthy_long = failing_status == HealthStatus::Unhealthy
                && now.saturating_sub(failing_since) > cascade_ms;

            let incoming: Vec<usize> =
                graph.reverse[failing].iter().filter(|&&e| graph.edges[e].live).copied().collect();
            for edge_idx in incoming {
                let edge = graph.edges[edge_idx];
                let dependent = edge.from;
                let before = graph.nodes[dependent].status;

                let target = match edge.kind {
                    DependencyKind::Critical => {
                        if unhealthy_long {
                            HealthStatus::Unhealthy
                        } else {
                            HealthStatus::Degraded
                        }
                    }
                    DependencyKind::Required => HealthStatus::Degraded,
                    DependencyKind::Optional | DependencyKind::Fallback => {
                        effects.push(PropagationEffect {
                            service: graph.nodes[dependent].service.clone(),
                            from: before,
                            to: before,
                            via: graph.nodes[failing].service.clone(),
                            kind: edge.kind,
                        });
                        continue;
                    }
                };

                let after = before.worst(target);
                if after != before {
                    graph.nodes[dependent].status = after;
                    graph.nodes[dependent].status_since_ms = now;
                    tracing::warn!(
                        service = %graph.nodes[dependent].service,
                        via = %graph.nodes[failing].service,
                        from = %before,
                        to = %after,
                        "dependency propagation"
                    );
                }
                effects.push(PropagationEffect {
                    service: graph.nodes[dependent].service.clone(),
                    from: before,
                    to: after,
                    via: graph.nodes[failing].service.clone(),
                    kind: edge.kind,
                });

                if !visited[dependent] {
                    visited[dependent] = true;
                    queue.push_back(dependent);
                }
            }
        }

        effects
    }

    /// Re-run cascade checks for dependencies that have stayed Unhealthy
    /// past the cascade delay. Called from the background health loop.
    pub fn recheck_cascades(&self) -> Vec<PropagationEffect> {
        let now = self.clock.now_millis();
        let cascade_ms = self.cascade_delay.as_millis() as u64;
        let overdue: Vec<String> = {
            let graph = self.graph.read().expect("DependencyChain poisoned");
            graph
                .nodes
                .iter()
                .filter(|n| {
                    n.status == HealthStatus::Unhealthy
                        && now.saturating_sub(n.status_since_ms) > cascade_ms
                })
                .map(|n| n.service.clone())
                .collect()
        };
        let mut effects = Vec::new();
        for service in overdue {
            effects.extend(self.propagate(&service, HealthStatus::Unhealthy));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn chain() -> (DependencyChain, ManualClock) {
        let clock = ManualClock::new();
        let chain = DependencyChain::new(Arc::new(clock.clone()), Duration::from_secs(10));
        (chain, clock)
    }

    #[test]
    fn unknown_until_registered() {
        let (chain, _clock) = chain();
        assert_eq!(chain.health_of("ghost"), HealthStatus::Unknown);
        chain.set_status("ghost", HealthStatus::Healthy);
        assert_eq!(chain.health_of("ghost"), HealthStatus::Healthy);
    }

    #[test]
    fn add_and_remove_edges() {
        let (chain, _clock) = chain();
        chain.add("api", "db", DependencyKind::Critical, 0.9);
        assert_eq!(chain.dependencies_of("api").len(), 1);
        assert_eq!(chain.dependents_of("db"), vec![("api".to_string(), DependencyKind::Critical)]);

        chain.remove("api", "db");
        assert!(chain.dependencies_of("api").is_empty());
        assert!(chain.dependents_of("db").is_empty());
    }

    #[test]
    fn re_adding_an_edge_updates_in_place() {
        let (chain, _clock) = chain();
        chain.add("api", "db", DependencyKind::Optional, 0.1);
        chain.add("api", "db", DependencyKind::Critical, 1.0);
        let deps = chain.dependencies_of("api");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].1, DependencyKind::Critical);
    }

    #[test]
    fn critical_failure_degrades_dependents_immediately() {
        let (chain, _clock) = chain();
        chain.add("api", "db", DependencyKind::Critical, 1.0);
        chain.set_status("api", HealthStatus::Healthy);

        let effects = chain.propagate("db", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded);
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].to, HealthStatus::Degraded);
        assert_eq!(effects[0].via, "db");
    }

    #[test]
    fn critical_failure_cascades_to_unhealthy_after_delay() {
        let (chain, clock) = chain();
        chain.add("api", "db", DependencyKind::Critical, 1.0);
        chain.propagate("db", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded);

        clock.advance(11_000);
        chain.recheck_cascades();
        assert_eq!(chain.health_of("api"), HealthStatus::Unhealthy);
    }

    #[test]
    fn required_failure_only_degrades() {
        let (chain, clock) = chain();
        chain.add("api", "cache", DependencyKind::Required, 0.5);
        chain.propagate("cache", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded);

        clock.advance(60_000);
        chain.recheck_cascades();
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded, "required never cascades");
    }

    #[test]
    fn optional_failure_is_audit_only() {
        let (chain, _clock) = chain();
        chain.add("api", "metrics", DependencyKind::Optional, 0.1);
        chain.set_status("api", HealthStatus::Healthy);

        let effects = chain.propagate("metrics", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Healthy);
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].from, effects[0].to);
    }

    #[test]
    fn propagation_crosses_multiple_hops() {
        let (chain, _clock) = chain();
        chain.add("edge", "api", DependencyKind::Required, 0.8);
        chain.add("api", "db", DependencyKind::Required, 0.9);

        chain.propagate("db", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded);
        assert_eq!(chain.health_of("edge"), HealthStatus::Degraded);
    }

    #[test]
    fn cycles_terminate() {
        let (chain, _clock) = chain();
        chain.add("a", "b", DependencyKind::Required, 0.5);
        chain.add("b", "c", DependencyKind::Required, 0.5);
        chain.add("c", "a", DependencyKind::Required, 0.5);

        let effects = chain.propagate("a", HealthStatus::Unhealthy);
        // Bounded work despite the cycle: every node visited at most once.
        assert!(effects.len() <= 3);
        assert_eq!(chain.health_of("c"), HealthStatus::Degraded);
        assert_eq!(chain.health_of("b"), HealthStatus::Degraded);
    }

    #[test]
    fn recovery_propagates_no_degradation() {
        let (chain, _clock) = chain();
        chain.add("api", "db", DependencyKind::Critical, 1.0);
        chain.propagate("db", HealthStatus::Unhealthy);
        assert_eq!(chain.health_of("api"), HealthStatus::Degraded);

        let effects = chain.propagate("db", HealthStatus::Healthy);
        assert!(effects.is_empty(), "healthy transitions do not mark dependents");
    }
}
