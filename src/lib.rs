#![forbid(unsafe_code)]

//! # datapunk-mesh
//!
//! Service mesh reliability core: every service embeds this library to get
//! fault-tolerant outbound calls without owning any of the machinery.
//!
//! ## What's inside
//!
//! - **Circuit breakers** with pluggable strategies: basic, gradual
//!   recovery, dependency-aware, rate-limited, health-aware, predictive
//! - **Retry engine** with six backoff strategies and a wall-time budget
//! - **Service discovery** over a pluggable registry (Consul-compatible
//!   wire semantics) with a DNS SRV fallback, caching, and watches
//! - **Health-aware load balancing** with per-instance connection pools,
//!   graceful drain, and failure/restore tracking
//! - **Adaptive timeouts**, **failure prediction**, **rate limiting**, and
//!   **priority-reserved admission slots**
//!
//! ## Quick start
//!
//! ```rust
//! use datapunk_mesh::{CallOptions, Instance, Mesh, MeshConfig, Transport};
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct HttpTransport;
//!
//! #[async_trait]
//! impl Transport for HttpTransport {
//!     type Error = std::io::Error;
//!
//!     async fn invoke(
//!         &self,
//!         instance: &Instance,
//!         _operation: &str,
//!         payload: &[u8],
//!     ) -> Result<Vec<u8>, Self::Error> {
//!         // Hand the opaque payload to your RPC/HTTP client here.
//!         let _ = instance.endpoint();
//!         Ok(payload.to_vec())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mesh = Mesh::new(MeshConfig::default(), HttpTransport)?;
//!     mesh.register("echo", "127.0.0.1", 8080, vec![], Default::default()).await?;
//!
//!     let reply = mesh.call("echo", "ping", b"{}", CallOptions::default()).await?;
//!     assert_eq!(reply, b"{}");
//!     mesh.close();
//!     Ok(())
//! }
//! ```
//!
//! The mesh transports opaque payloads over a host-supplied [`Transport`];
//! it never invents a wire protocol. All state is process-local: no
//! persistence, no hidden singletons, one [`Mesh`] handle to close.

mod adaptive;
mod adaptive_timeout;
mod backoff;
mod balancer;
mod cancel;
mod circuit;
mod clock;
mod config;
mod dependency;
mod discovery;
mod error;
mod health;
mod mesh;
mod metrics;
mod predictor;
mod rate_limit;
mod retry;
mod window;

// Re-exports
pub use adaptive::Adaptive;
pub use adaptive_timeout::AdaptiveTimeout;
pub use backoff::{AttemptOutcome, Backoff, BackoffContext, BackoffSession};
pub use balancer::{Lease, LoadBalancer};
pub use cancel::CancellationToken;
pub use circuit::priority::{Priority, PrioritySlots};
pub use circuit::registry::{BreakerHandle, BreakerRegistry};
pub use circuit::strategy::BreakerStrategy;
pub use circuit::{CallPermit, CircuitBreaker, CircuitState, DenialReason};
pub use clock::{
    Clock, ManualClock, MonotonicClock, NoopTimer, RecordingTimer, Timer, TokioTimer,
};
pub use config::{
    BackoffConfig, BackoffKind, BalancerConfig, BalancerKind, CircuitConfig, CircuitStrategyKind,
    DiscoveryBackendKind, DiscoveryConfig, HealthConfig, MeshConfig, PredictorConfig,
    PriorityConfig, RateLimitConfig, RateLimitKind, ResourceThresholds, RetryConfig,
    TimeoutConfig, TimeoutKind,
};
pub use dependency::{DependencyChain, DependencyKind, PropagationEffect};
pub use discovery::{
    CheckRegistration, Discovery, DnsBackend, InMemoryRegistry, Instance, InstanceRegistration,
    InstanceState, RegistryBackend, RegistryError, SrvRecord, SrvResolver, StaticSrvResolver,
    WatchHandle,
};
pub use error::{CallFailure, ConfigError, ErrorKind, MeshError};
pub use health::{HealthMonitor, HealthStatus, ResourceKind, ResourceMetrics, ServiceHealth};
pub use mesh::{CallOptions, Mesh, MeshBuilder, Transport};
pub use metrics::{render_prometheus, LogSink, MemorySink, MetricsSink, NullSink};
pub use predictor::{FailurePredictor, MetricKind, Prediction, Signal, SignalKind};
pub use rate_limit::{Decision, RateLimiter};
pub use retry::{Fingerprint, RetryAttempt, RetryPolicy, RetryPolicyBuilder, RetrySession};
pub use window::{BucketSnapshot, ResourceSample, RollingWindow, WindowTotals};

pub mod prelude;
