//! DNS SRV fallback backend.
//!
//! Looks up `_<service>._tcp.<suffix>` through a [`SrvResolver`], resolves
//! each target's A/AAAA records, and synthesizes Active instances with
//! empty metadata and a full health score. Registration is not supported;
//! DNS is a read-only view.

use super::instance::{Instance, InstanceState};
use super::registry::{InstanceRegistration, RegistryBackend, RegistryError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::lookup_host;

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

/// Source of SRV answers. Production embedders back this with their
/// resolver; tests and static deployments use [`StaticSrvResolver`].
#[async_trait]
pub trait SrvResolver: Send + Sync + std::fmt::Debug {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, RegistryError>;
}

/// Table-driven resolver.
#[derive(Debug, Default)]
pub struct StaticSrvResolver {
    records: Mutex<HashMap<String, Vec<SrvRecord>>>,
}

impl StaticSrvResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, records: Vec<SrvRecord>) {
        self.records.lock().expect("StaticSrvResolver poisoned").insert(name.into(), records);
    }
}

#[async_trait]
impl SrvResolver for StaticSrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, RegistryError> {
        self.records
            .lock()
            .expect("StaticSrvResolver poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

/// Read-only registry backend over DNS.
#[derive(Debug)]
pub struct DnsBackend {
    resolver: Box<dyn SrvResolver>,
    suffix: String,
    /// Resolve SRV targets to addresses via the system resolver. Disabled
    /// in tests where targets are already literal addresses.
    resolve_targets: bool,
}

impl DnsBackend {
    pub fn new(resolver: Box<dyn SrvResolver>, suffix: impl Into<String>) -> Self {
        Self { resolver, suffix: suffix.into(), resolve_targets: true }
    }

    pub fn with_literal_targets(mut self) -> Self {
        self.resolve_targets = false;
        self
    }

    fn srv_name(&self, service: &str) -> String {
        format!("_{}._tcp.{}", service, self.suffix)
    }

    async fn resolve(&self, record: &SrvRecord) -> Vec<SocketAddr> {
        if !self.resolve_targets {
            let literal = if record.target.contains(':') {
                format!("[{}]:{}", record.target, record.port)
            } else {
                format!("{}:{}", record.target, record.port)
            };
            return match literal.parse() {
                Ok(addr) => vec![addr],
                Err(_) => Vec::new(),
            };
        }
        // A/AAAA dual-stack through the system resolver.
        match lookup_host((record.target.as_str(), record.port)).await {
            Ok(addrs) => addrs.collect(),
            Err(error) => {
                tracing::debug!(target = %record.target, %error, "dns target resolution failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl RegistryBackend for DnsBackend {
    async fn register(&self, _registration: InstanceRegistration) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported("dns backend is read-only"))
    }

    async fn deregister(&self, _service: &str, _instance_id: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported("dns backend is read-only"))
    }

    async fn get_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        let name = self.srv_name(service);
        let records = self.resolver.lookup_srv(&name).await?;
        let mut instances = Vec::new();
        for record in &records {
            for addr in self.resolve(record).await {
                instances.push(Instance {
                    id: format!("{}:{}", addr.ip(), addr.port()),
                    service: service.to_string(),
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    tags: Vec::new(),
                    metadata: HashMap::new(),
                    state: InstanceState::Active,
                    last_health_at_ms: 0,
                    health_score: 1.0,
                });
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances.dedup_by(|a, b| a.id == b.id);
        Ok(instances)
    }

    async fn watch(
        &self,
        service: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<Instance>), RegistryError> {
        // DNS has no change feed; emulate a long poll with one re-resolve.
        tokio::time::sleep(wait).await;
        Ok((last_index + 1, self.get_instances(service).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with(records: Vec<SrvRecord>) -> DnsBackend {
        let resolver = StaticSrvResolver::new();
        resolver.insert("_billing._tcp.svc.cluster.local", records);
        DnsBackend::new(Box::new(resolver), "svc.cluster.local").with_literal_targets()
    }

    #[tokio::test]
    async fn synthesizes_instances_from_srv_records() {
        let backend = backend_with(vec![
            SrvRecord { target: "10.0.0.1".into(), port: 8080 },
            SrvRecord { target: "10.0.0.2".into(), port: 8080 },
        ]);

        let instances = backend.get_instances("billing").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address, "10.0.0.1");
        assert_eq!(instances[0].state, InstanceState::Active);
        assert_eq!(instances[0].health_score, 1.0);
        assert!(instances[0].metadata.is_empty());
    }

    #[tokio::test]
    async fn ipv6_targets_are_supported() {
        let backend = backend_with(vec![SrvRecord { target: "::1".into(), port: 9000 }]);
        let instances = backend.get_instances("billing").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].port, 9000);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let backend = backend_with(vec![]);
        let err = backend.get_instances("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn registration_is_rejected() {
        let backend = backend_with(vec![]);
        let err = backend
            .register(InstanceRegistration {
                id: "i-1".into(),
                service: "billing".into(),
                address: "10.0.0.1".into(),
                port: 80,
                tags: vec![],
                metadata: HashMap::new(),
                check: super::super::registry::CheckRegistration {
                    http_url: "http://10.0.0.1/health".into(),
                    interval_s: 10,
                    timeout_s: 2,
                    deregister_after: 60,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported(_)));
    }
}
