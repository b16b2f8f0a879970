//! Registry of named circuit breakers for operational introspection.

use super::{CircuitBreaker, CircuitState, SharedState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handle to inspect/reset one breaker without owning it.
#[derive(Clone, Debug)]
pub struct BreakerHandle {
    state: Arc<SharedState>,
}

impl BreakerHandle {
    /// Reset the breaker to Closed, clearing failure counts.
    pub fn reset(&self) {
        self.state.reset();
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }
}

/// Breaker handles keyed by service.
#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, BreakerHandle>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker's handle. An existing entry is overwritten.
    pub fn register(&self, breaker: &CircuitBreaker) {
        let handle = BreakerHandle { state: breaker.shared() };
        self.inner
            .lock()
            .expect("BreakerRegistry poisoned")
            .insert(breaker.service().to_string(), handle);
    }

    pub fn get(&self, service: &str) -> Option<BreakerHandle> {
        self.inner.lock().expect("BreakerRegistry poisoned").get(service).cloned()
    }

    /// Reset a registered breaker. Err if the service is unknown.
    pub fn reset(&self, service: &str) -> Result<(), String> {
        match self.get(service) {
            Some(handle) => {
                handle.reset();
                Ok(())
            }
            None => Err(format!("breaker not found: {service}")),
        }
    }

    /// Sorted snapshot of every breaker's state.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().expect("BreakerRegistry poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
