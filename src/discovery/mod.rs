//! Service discovery: registration, cached lookup, and watches.
//!
//! The facade sits over a pluggable [`RegistryBackend`] (in-memory, a
//! Consul-compatible client, or the DNS fallback) and adds the mesh-side
//! behavior: registration ids and TTL checks, a per-service lookup cache,
//! and watch loops that push full instance lists to callbacks and watch
//! channels, retrying with exponential backoff capped at 30 s.

pub mod dns;
pub mod instance;
pub mod registry;

pub use dns::{DnsBackend, SrvRecord, SrvResolver, StaticSrvResolver};
pub use instance::{Instance, InstanceState};
pub use registry::{
    CheckRegistration, InMemoryRegistry, InstanceRegistration, RegistryBackend, RegistryError,
};

use crate::clock::Clock;
use crate::config::DiscoveryConfig;
use crate::metrics::MetricsSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Watch errors back off exponentially up to this ceiling.
const WATCH_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Initial backoff after a watch error.
const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
/// Long-poll duration for blocking watches.
const WATCH_POLL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
struct CacheEntry {
    instances: Vec<Instance>,
    fetched_at_ms: u64,
}

/// Handle to a running watch; aborting it stops the loop.
#[derive(Debug)]
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Discovery facade with caching and watches.
pub struct Discovery {
    backend: Arc<dyn RegistryBackend>,
    config: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    channels: Mutex<HashMap<String, watch::Sender<Vec<Instance>>>>,
    watchers: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl Discovery {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        config: DiscoveryConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            backend,
            config,
            clock,
            sink,
            cache: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn RegistryBackend> {
        self.backend.clone()
    }

    /// Register this process as an instance of `service`. Returns the
    /// generated service id used for deregistration.
    pub async fn register(
        &self,
        service: &str,
        host: &str,
        port: u16,
        tags: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, RegistryError> {
        let id = format!("{}-{}", service, uuid::Uuid::new_v4());
        let registration = InstanceRegistration {
            id: id.clone(),
            service: service.to_string(),
            address: host.to_string(),
            port,
            tags,
            metadata,
            check: CheckRegistration {
                http_url: format!("http://{}:{}/health", host, port),
                interval_s: self.config.health_check_interval_s,
                timeout_s: 2,
                deregister_after: self.config.deregister_timeout_s,
            },
        };
        self.backend.register(registration).await?;
        self.invalidate(service);
        self.sink.counter("mesh_registrations_total", &[("service", service)], 1);
        tracing::info!(service, id = %id, "instance registered");
        Ok(id)
    }

    pub async fn deregister(&self, service: &str, instance_id: &str) -> Result<(), RegistryError> {
        self.backend.deregister(service, instance_id).await?;
        self.invalidate(service);
        tracing::info!(service, id = instance_id, "instance deregistered");
        Ok(())
    }

    /// Drop the cached entry for `service`.
    pub fn invalidate(&self, service: &str) {
        self.cache.write().expect("Discovery cache poisoned").remove(service);
    }

    /// Look up instances of `service`, serving from cache within the TTL.
    /// Only Active and Draining instances are returned; an empty result is
    /// `ServiceNotFound`.
    pub async fn discover(
        &self,
        service: &str,
        use_cache: bool,
    ) -> Result<Vec<Instance>, RegistryError> {
        let now = self.clock.now_millis();
        let ttl_ms = self.config.cache_ttl().as_millis() as u64;

        if use_cache {
            let cache = self.cache.read().expect("Discovery cache poisoned");
            if let Some(entry) = cache.get(service) {
                if now.saturating_sub(entry.fetched_at_ms) < ttl_ms {
                    return filter_discoverable(service, entry.instances.clone());
                }
            }
        }

        let instances = self.backend.get_instances(service).await.map_err(|e| match e {
            RegistryError::NotFound(s) => RegistryError::NotFound(s),
            other => RegistryError::Unavailable(other.to_string()),
        })?;
        self.cache.write().expect("Discovery cache poisoned").insert(
            service.to_string(),
            CacheEntry { instances: instances.clone(), fetched_at_ms: now },
        );
        self.sink.counter("mesh_discovery_fetches_total", &[("service", service)], 1);
        filter_discoverable(service, instances)
    }

    /// Subscribe to instance-list changes. The channel starts empty and
    /// receives every update the watch loop sees.
    pub fn subscribe(&self, service: &str) -> watch::Receiver<Vec<Instance>> {
        let mut channels = self.channels.lock().expect("Discovery channels poisoned");
        if let Some(tx) = channels.get(service) {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(Vec::new());
        channels.insert(service.to_string(), tx);
        drop(channels);
        self.spawn_watch_loop(service, None);
        rx
    }

    /// Watch `service` with a callback receiving the full current list on
    /// every change. Errors back off exponentially; updates are never
    /// silently dropped.
    pub fn watch(
        &self,
        service: &str,
        callback: impl Fn(Vec<Instance>) + Send + Sync + 'static,
    ) -> WatchHandle {
        self.spawn_watch_loop(service, Some(Arc::new(callback)))
    }

    fn spawn_watch_loop(
        &self,
        service: &str,
        callback: Option<Arc<dyn Fn(Vec<Instance>) + Send + Sync>>,
    ) -> WatchHandle {
        let backend = self.backend.clone();
        let service = service.to_string();
        let channels = {
            let channels = self.channels.lock().expect("Discovery channels poisoned");
            channels.get(&service).cloned()
        };

        let task = tokio::spawn(async move {
            let mut index = 0u64;
            let mut backoff = WATCH_BACKOFF_INITIAL;
            loop {
                match backend.watch(&service, index, WATCH_POLL).await {
                    Ok((new_index, instances)) => {
                        backoff = WATCH_BACKOFF_INITIAL;
                        if new_index == index {
                            continue; // long poll timed out, nothing changed
                        }
                        index = new_index;
                        let visible: Vec<Instance> = instances
                            .into_iter()
                            .filter(|i| i.state.is_discoverable())
                            .collect();
                        if let Some(tx) = &channels {
                            let _ = tx.send(visible.clone());
                        }
                        if let Some(cb) = &callback {
                            cb(visible);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(service = %service, %error, backoff = ?backoff, "watch error");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(WATCH_BACKOFF_CAP);
                    }
                }
            }
        });

        self.watchers.lock().expect("Discovery watchers poisoned").push(task.abort_handle());
        WatchHandle { task }
    }

    /// Stop every watch loop.
    pub fn close(&self) {
        for task in self.watchers.lock().expect("Discovery watchers poisoned").drain(..) {
            task.abort();
        }
    }
}

fn filter_discoverable(
    service: &str,
    instances: Vec<Instance>,
) -> Result<Vec<Instance>, RegistryError> {
    let visible: Vec<Instance> =
        instances.into_iter().filter(|i| i.state.is_discoverable()).collect();
    if visible.is_empty() {
        return Err(RegistryError::NotFound(service.to_string()));
    }
    Ok(visible)
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery").field("config", &self.config).finish()
    }
}
