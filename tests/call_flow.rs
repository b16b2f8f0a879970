//! End-to-end call pipeline scenarios against an in-memory registry and a
//! scripted transport.

mod common;

use common::{ScriptedTransport, SharedTransport};
use datapunk_mesh::{
    CallOptions, CancellationToken, CircuitState, ErrorKind, ManualClock, MemorySink, Mesh,
    MeshConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quick_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.retry.initial_delay_ms = 10;
    config.retry.multiplier = 2.0;
    config.retry.jitter = false;
    config
}

async fn register(mesh: &Mesh<SharedTransport>, service: &str, port: u16) -> String {
    mesh.register(service, "127.0.0.1", port, vec![], HashMap::new())
        .await
        .expect("registration succeeds")
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let transport = ScriptedTransport::failing_first(1);
    let sink = Arc::new(MemorySink::new());
    let mesh = Mesh::builder(quick_config(), transport.clone())
        .sink(sink.clone())
        .build()
        .unwrap();
    register(&mesh, "svc", 8080).await;

    let started = Instant::now();
    let reply = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap();

    assert_eq!(reply, b"{}");
    assert_eq!(transport.invocations(), 2, "one failure, one success");
    assert!(started.elapsed() >= Duration::from_millis(10), "backoff delay applied");
    assert_eq!(sink.histogram_count("mesh_call_attempts", &[("service", "svc")]), 1);
    mesh.close();
}

#[tokio::test]
async fn circuit_trips_and_rejects_without_invoking_transport() {
    let transport = ScriptedTransport::always_failing();
    let mut config = quick_config();
    config.retry.max_attempts = 1;
    // Isolate the breaker from instance-level failure marking.
    config.lb.fail_after = 100;
    config.lb.min_health_score = 0.0;
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    for _ in 0..10 {
        let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Transport | ErrorKind::CircuitOpen));
    }
    assert_eq!(
        transport.invocations(),
        5,
        "transport untouched once the circuit opened at the threshold"
    );
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Open);

    let eleventh = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(eleventh.kind(), ErrorKind::CircuitOpen);
    assert_eq!(transport.invocations(), 5);
    mesh.close();
}

#[tokio::test]
async fn circuit_recovers_through_half_open() {
    let clock = ManualClock::new();
    let transport = ScriptedTransport::always_failing();
    let mut config = quick_config();
    config.retry.max_attempts = 1;
    config.lb.fail_after = 100;
    config.lb.min_health_score = 0.0;
    let mesh = Mesh::builder(config, transport.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    register(&mesh, "svc", 8080).await;

    for _ in 0..5 {
        let _ = mesh.call("svc", "ping", b"{}", CallOptions::default()).await;
    }
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Open);

    // Service recovers; reset timeout elapses.
    transport.set_failing(false);
    clock.advance(30_001);

    for _ in 0..5 {
        mesh.call("svc", "ping", b"{}", CallOptions::default())
            .await
            .expect("probes and post-recovery calls succeed");
    }
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Closed);
    mesh.close();
}

#[tokio::test]
async fn unknown_service_is_service_not_found() {
    let transport = ScriptedTransport::ok();
    let mesh = Mesh::new(quick_config(), transport.clone()).unwrap();

    let err = mesh.call("ghost", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
    assert_eq!(transport.invocations(), 0);
    mesh.close();
}

#[tokio::test]
async fn failed_instances_leave_no_healthy_candidates() {
    let transport = ScriptedTransport::always_failing();
    let mut config = quick_config();
    config.retry.max_attempts = 1;
    config.circuit.failure_threshold = 50; // keep the breaker out of the way
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    // Three consecutive failures mark the only instance Failed locally.
    for _ in 0..3 {
        let _ = mesh.call("svc", "ping", b"{}", CallOptions::default()).await;
    }
    assert_eq!(transport.invocations(), 3);

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoHealthyInstance);
    assert_eq!(transport.invocations(), 3, "no instance left to invoke");
    mesh.close();
}

#[tokio::test]
async fn per_attempt_timeouts_are_retryable_and_reported() {
    let transport = ScriptedTransport::ok();
    transport.set_delay(Some(Duration::from_millis(500)));
    let mut config = quick_config();
    config.retry.max_attempts = 2;
    config.retry.timeout_per_attempt_ms = Some(50);
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.attempts, 2, "timeouts retried to exhaustion");
    assert_eq!(transport.invocations(), 2);
    mesh.close();
}

#[tokio::test]
async fn cancellation_is_observed_promptly_and_not_counted() {
    let transport = ScriptedTransport::ok();
    transport.set_delay(Some(Duration::from_secs(30)));
    let mesh = Mesh::new(quick_config(), transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = mesh
        .call("svc", "ping", b"{}", CallOptions::default().with_cancel(token))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1), "cancel observed quickly");
    assert_eq!(mesh.circuit_state("svc"), CircuitState::Closed, "no failure recorded");
    mesh.close();
}

#[tokio::test]
async fn front_door_rate_limit_rejects_immediately() {
    let transport = ScriptedTransport::ok();
    let mut config = quick_config();
    config.rate_limit.rps = 1.0;
    config.rate_limit.burst = 2.0;
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap();
    mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap();

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.attempts, 0, "denied before any attempt");
    assert_eq!(transport.invocations(), 2);
    mesh.close();
}

#[tokio::test]
async fn retry_budget_bounds_total_wall_time() {
    let transport = ScriptedTransport::always_failing();
    let mut config = quick_config();
    config.retry.max_attempts = 10;
    config.retry.initial_delay_ms = 200;
    config.retry.budget_ms = Some(150);
    let mesh = Mesh::new(config, transport.clone()).unwrap();
    register(&mesh, "svc", 8080).await;

    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExhausted);
    assert_eq!(transport.invocations(), 1, "aborts instead of sleeping past the budget");
    mesh.close();
}

#[tokio::test]
async fn drain_removes_an_instance_from_rotation() {
    let transport = ScriptedTransport::ok();
    let mesh = Mesh::new(quick_config(), transport.clone()).unwrap();
    let first = register(&mesh, "svc", 8080).await;
    let _second = register(&mesh, "svc", 8081).await;

    assert_eq!(mesh.discover("svc").await.unwrap().len(), 2);

    let fully = mesh.drain("svc", &first).await;
    assert!(fully, "no in-flight leases to wait for");

    let remaining = mesh.discover("svc").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, first);

    for _ in 0..5 {
        mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap();
    }
    mesh.close();
}

#[tokio::test]
async fn deregistered_ids_stop_resolving() {
    let transport = ScriptedTransport::ok();
    let mesh = Mesh::new(quick_config(), transport.clone()).unwrap();
    let id = register(&mesh, "svc", 8080).await;

    mesh.deregister(&id).await.unwrap();
    let err = mesh.call("svc", "ping", b"{}", CallOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);

    let err = mesh.deregister(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
    mesh.close();
}
