//! Circuit breaker strategy behavior through the full call pipeline.

mod common;

use common::{ScriptedTransport, SharedTransport};
use datapunk_mesh::{
    CallOptions, CircuitState, CircuitStrategyKind, DependencyKind, ErrorKind, HealthStatus,
    ManualClock, Mesh, MeshConfig, MeshError, Priority,
};
use std::collections::HashMap;
use std::sync::Arc;

fn config_with(strategy: CircuitStrategyKind) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.circuit.strategy = strategy;
    config.retry.max_attempts = 1;
    config.retry.jitter = false;
    // Strategy tests isolate the breaker from instance-level marking.
    config.lb.fail_after = 100;
    config.lb.min_health_score = 0.0;
    config
}

async fn register(mesh: &Mesh<SharedTransport>, service: &str) {
    mesh.register(service, "127.0.0.1", 8080, vec![], HashMap::new())
        .await
        .expect("registration succeeds");
}

#[tokio::test]
async fn dependency_aware_denies_when_critical_dependency_is_unhealthy() {
    let transport = ScriptedTransport::ok();
    let mesh = Mesh::new(config_with(CircuitStrategyKind::Dependency), transport.clone()).unwrap();
    register(&mesh, "svc").await;

    mesh.update_dependency("svc", "ledger", DependencyKind::Critical, 1.0);
    mesh.dependency_chain().set_status("ledger", HealthStatus::Unhealthy);

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    match &err.error {
        MeshError::CircuitOpen { cause: Some(cause), .. } => {
            assert_eq!(cause, "dependency_unhealthy:ledger");
        }
        other => panic!("expected dependency denial, got {:?}", other),
    }
    assert_eq!(transport.invocations(), 0, "denied before the transport");

    // Recovery of the dependency restores admission.
    mesh.dependency_chain().set_status("ledger", HealthStatus::Healthy);
    mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap();
    mesh.close();
}

#[tokio::test]
async fn gradual_recovery_ramps_back_to_closed() {
    let clock = ManualClock::new();
    let transport = ScriptedTransport::always_failing();
    let mesh = Mesh::builder(config_with(CircuitStrategyKind::Gradual), transport.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    register(&mesh, "svc").await;

    for _ in 0..5 {
        let _ = mesh.call("svc", "ping", b"{}", CallOptions::default()).await;
    }
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Open);

    transport.set_failing(false);

    // Each stable window doubles the admission rate; with the clock jumping
    // a full window per iteration, a handful of admitted probes close the
    // circuit. Denied probes while the rate is low are expected.
    let mut admitted = 0;
    for _ in 0..200 {
        clock.advance(31_000);
        match mesh.call("svc", "ping", b"{}", CallOptions::default()).await {
            Ok(_) => admitted += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::CircuitOpen),
        }
        if mesh.circuit_state("svc") == CircuitState::Closed {
            break;
        }
    }

    assert_eq!(mesh.circuit_state("svc"), CircuitState::Closed, "ramp completed");
    assert!(admitted >= 4, "rate had to double several times, saw {} successes", admitted);
    mesh.close();
}

#[tokio::test]
async fn health_aware_sheds_everything_when_unhealthy() {
    let transport = ScriptedTransport::always_failing();
    let mut config = config_with(CircuitStrategyKind::HealthAware);
    config.circuit.failure_threshold = 100; // circuit itself stays closed
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc").await;

    // One failing call drives the service's error rate over the limit.
    let first = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(first.kind(), ErrorKind::Transport);
    assert_eq!(transport.invocations(), 1);

    // Even with the circuit Closed, admission drops to zero.
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Closed);
    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    match &err.error {
        MeshError::CircuitOpen { cause: Some(cause), .. } => {
            assert!(cause.starts_with("health_shed"), "cause was {}", cause);
        }
        other => panic!("expected health shed, got {:?}", other),
    }
    assert_eq!(transport.invocations(), 1);
    mesh.close();
}

#[tokio::test]
async fn predictive_strategy_denies_forecast_failures() {
    let transport = ScriptedTransport::always_failing();
    let mut config = config_with(CircuitStrategyKind::Predictive);
    config.circuit.failure_threshold = 1_000;
    config.predictor.deny_product = 0.4;
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc").await;

    // Thirty observed failures give the predictor a confident, bleak view.
    for _ in 0..30 {
        let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
    assert_eq!(transport.invocations(), 30);

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PredictedFailure);
    assert_eq!(transport.invocations(), 30, "denied before the transport");
    mesh.close();
}

#[tokio::test]
async fn priority_floor_sheds_low_priorities_only() {
    let transport = ScriptedTransport::ok();
    let mesh = Mesh::new(config_with(CircuitStrategyKind::Basic), transport.clone()).unwrap();
    register(&mesh, "svc").await;

    mesh.set_priority_floor(Priority::High);

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);

    mesh.call(
        "svc",
        "ping",
        b"{}",
        CallOptions::default().with_priority(Priority::Critical),
    )
    .await
    .expect("critical traffic passes the floor");

    mesh.set_priority_floor(Priority::Bulk);
    mesh.call("svc", "ping", b"{}", CallOptions::default())
        .await
        .expect("floor lowered, normal traffic admitted again");
    mesh.close();
}
