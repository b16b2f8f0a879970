//! Service and instance model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Instance lifecycle.
///
/// Active ⇄ Draining → Inactive; Active → Failed, recovering to Active only
/// through consecutive passing checks or re-registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Active,
    Draining,
    Inactive,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        }
    }

    /// Whether discovery should still hand this instance to callers.
    /// Draining stays visible for in-flight traffic.
    pub fn is_discoverable(&self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }
}

/// One running process registered under a service name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub state: InstanceState,
    /// Last successful health check, milliseconds on the mesh clock.
    #[serde(default)]
    pub last_health_at_ms: u64,
    /// Rolling health score in `[0, 1]`.
    #[serde(default = "default_health_score")]
    pub health_score: f64,
}

fn default_health_score() -> f64 {
    1.0
}

impl Instance {
    pub fn new(id: impl Into<String>, service: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            metadata: HashMap::new(),
            state: InstanceState::Active,
            last_health_at_ms: 0,
            health_score: 1.0,
        }
    }

    /// `address:port` for transports.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_remains_discoverable() {
        assert!(InstanceState::Active.is_discoverable());
        assert!(InstanceState::Draining.is_discoverable());
        assert!(!InstanceState::Inactive.is_discoverable());
        assert!(!InstanceState::Failed.is_discoverable());
    }

    #[test]
    fn endpoint_joins_address_and_port() {
        let instance = Instance::new("i-1", "billing", "10.0.0.7", 8443);
        assert_eq!(instance.endpoint(), "10.0.0.7:8443");
    }

    #[test]
    fn instance_deserializes_with_defaults() {
        let instance: Instance = serde_json::from_str(
            r#"{"id":"i-1","service":"billing","address":"10.0.0.7","port":80}"#,
        )
        .unwrap();
        assert_eq!(instance.state, InstanceState::Active);
        assert_eq!(instance.health_score, 1.0);
    }
}
