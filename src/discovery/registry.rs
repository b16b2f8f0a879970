//! Registry backend abstraction and in-memory implementation.
//!
//! The wire types follow Consul HTTP v1 semantics: an instance registers as
//! `{id, service, address, port, tags[], metadata{}, check:{http_url,
//! interval_s, timeout_s, deregister_after}}` and watches are index-based
//! blocking queries.

use super::instance::{Instance, InstanceState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// TTL health check attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRegistration {
    pub http_url: String,
    pub interval_s: u64,
    pub timeout_s: u64,
    /// Registry-side grace before a failing instance is deregistered.
    pub deregister_after: u64,
}

/// Wire form of a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub check: CheckRegistration,
}

impl InstanceRegistration {
    pub fn into_instance(self, now_ms: u64) -> Instance {
        Instance {
            id: self.id,
            service: self.service,
            address: self.address,
            port: self.port,
            tags: self.tags,
            metadata: self.metadata,
            state: InstanceState::Active,
            last_health_at_ms: now_ms,
            health_score: 1.0,
        }
    }
}

/// Registry-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("operation unsupported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Pluggable registry backend: register, deregister, list, blocking-watch.
#[async_trait]
pub trait RegistryBackend: Send + Sync + std::fmt::Debug {
    async fn register(&self, registration: InstanceRegistration) -> Result<(), RegistryError>;

    async fn deregister(&self, service: &str, instance_id: &str) -> Result<(), RegistryError>;

    /// Every known instance of `service`, in any state. Empty is not an
    /// error here; the facade turns it into `ServiceNotFound`.
    async fn get_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError>;

    /// Blocking watch: waits (up to `wait`) until the service's index moves
    /// past `last_index`, then returns `(new_index, instances)`. A timeout
    /// returns the current state unchanged.
    async fn watch(
        &self,
        service: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<Instance>), RegistryError>;
}

#[derive(Debug, Default)]
struct Catalog {
    services: HashMap<String, HashMap<String, Instance>>,
}

/// In-memory registry used in tests and single-process deployments.
#[derive(Debug)]
pub struct InMemoryRegistry {
    catalog: Mutex<Catalog>,
    index: AtomicU64,
    changed: Notify,
    /// Test hook: when set, every call fails with this error.
    outage: Mutex<Option<RegistryError>>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self {
            catalog: Mutex::new(Catalog::default()),
            index: AtomicU64::new(1),
            changed: Notify::new(),
            outage: Mutex::new(None),
        }
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a registry outage (or clear it with `None`).
    pub fn set_outage(&self, error: Option<RegistryError>) {
        *self.outage.lock().expect("InMemoryRegistry poisoned") = error;
    }

    /// Directly mutate an instance's state, as a registry operator would.
    pub fn set_instance_state(&self, service: &str, instance_id: &str, state: InstanceState) {
        let mut catalog = self.catalog.lock().expect("InMemoryRegistry poisoned");
        if let Some(instance) = catalog
            .services
            .get_mut(service)
            .and_then(|instances| instances.get_mut(instance_id))
        {
            instance.state = state;
        }
        drop(catalog);
        self.bump();
    }

    pub fn current_index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.index.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    fn check_outage(&self) -> Result<(), RegistryError> {
        match &*self.outage.lock().expect("InMemoryRegistry poisoned") {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RegistryBackend for InMemoryRegistry {
    async fn register(&self, registration: InstanceRegistration) -> Result<(), RegistryError> {
        self.check_outage()?;
        let mut catalog = self.catalog.lock().expect("InMemoryRegistry poisoned");
        let service = registration.service.clone();
        let instance = registration.into_instance(0);
        catalog.services.entry(service).or_default().insert(instance.id.clone(), instance);
        drop(catalog);
        self.bump();
        Ok(())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> Result<(), RegistryError> {
        self.check_outage()?;
        let mut catalog = self.catalog.lock().expect("InMemoryRegistry poisoned");
        let removed = catalog
            .services
            .get_mut(service)
            .map(|instances| instances.remove(instance_id).is_some())
            .unwrap_or(false);
        if catalog.services.get(service).is_some_and(|m| m.is_empty()) {
            catalog.services.remove(service);
        }
        drop(catalog);
        if removed {
            self.bump();
            Ok(())
        } else {
            Err(RegistryError::NotFound(format!("{service}/{instance_id}")))
        }
    }

    async fn get_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        self.check_outage()?;
        let catalog = self.catalog.lock().expect("InMemoryRegistry poisoned");
        let mut instances: Vec<Instance> = catalog
            .services
            .get(service)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn watch(
        &self,
        service: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<Instance>), RegistryError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.check_outage()?;
            let current = self.current_index();
            if current > last_index {
                return Ok((current, self.get_instances(service).await?));
            }
            let notified = self.changed.notified();
            if self.current_index() > last_index {
                continue;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok((current, self.get_instances(service).await?));
                }
            }
        }
    }
}
