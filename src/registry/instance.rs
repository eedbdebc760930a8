use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Static instance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance identifier, unique within its service
    pub id: String,
    /// Address the handler dispatches to (e.g. "10.0.0.7:8080")
    pub address: String,
}

/// One deployed replica of a logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance identifier
    pub id: String,
    /// Network address
    pub address: String,
    /// Instance-level health, independent of the service's circuit breaker
    pub healthy: bool,
    /// Last registration or heartbeat
    pub last_seen: SystemTime,
}

impl Instance {
    /// Create a new healthy instance seen now
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            healthy: true,
            last_seen: SystemTime::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Time since the instance was last seen
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_seen)
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }
}

impl From<InstanceConfig> for Instance {
    fn from(config: InstanceConfig) -> Self {
        Instance::new(config.id, config.address)
    }
}
