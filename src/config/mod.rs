use crate::circuit_breaker::{CircuitBreakerConfig, RetryConfig};
use crate::error::{MeshError, Result};
use crate::healthcheck::HealthCheckConfig;
use crate::loadbalancer::strategies::LoadBalancingStrategy;
use crate::registry::InstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main mesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Router configuration
    #[serde(default)]
    pub router: RouterConfig,
    /// Active health checking
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Logical services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-attempt handler timeout in milliseconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    /// Instance selection strategy
    #[serde(default)]
    pub load_balancing: LoadBalancingStrategy,
}

/// Per-service configuration, immutable once registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Logical service name
    pub name: String,
    /// Service version
    #[serde(default = "default_version")]
    pub version: String,
    /// Dependencies on other services (name -> version requirement)
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,
    /// Instances registered together with the service
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_attempt_timeout() -> u64 {
    5_000
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout(),
            load_balancing: LoadBalancingStrategy::default(),
        }
    }
}

impl RouterConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Validate router settings
    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout_ms == 0 {
            return Err(MeshError::Config(
                "Router attempt_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServiceConfig {
    /// A service with default breaker and retry settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            dependencies: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            instances: Vec::new(),
        }
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_instance(mut self, id: impl Into<String>, address: impl Into<String>) -> Self {
        self.instances.push(InstanceConfig {
            id: id.into(),
            address: address.into(),
        });
        self
    }

    /// Validate a single service definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::InvalidService(
                "Service name cannot be empty".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MeshError::InvalidService(format!(
                "Circuit breaker failure_threshold must be > 0 for service: {}",
                self.name
            )));
        }

        let factor = self.retry.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(MeshError::InvalidService(format!(
                "Retry backoff_factor must be >= 1.0 for service: {} (got {})",
                self.name, factor
            )));
        }

        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err(MeshError::InvalidService(format!(
                "Retry max_backoff_ms must be >= base_backoff_ms for service: {}",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            if instance.id.is_empty() {
                return Err(MeshError::InvalidService(format!(
                    "Instance id cannot be empty for service: {}",
                    self.name
                )));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(MeshError::InvalidService(format!(
                    "Duplicate instance id '{}' for service: {}",
                    instance.id, self.name
                )));
            }
        }

        Ok(())
    }
}

impl MeshConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MeshError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;

        if self.health_check.enabled {
            if self.health_check.interval_ms == 0 {
                return Err(MeshError::Config(
                    "Health check interval_ms must be > 0".to_string(),
                ));
            }
            if self.health_check.unhealthy_threshold == 0
                || self.health_check.healthy_threshold == 0
            {
                return Err(MeshError::Config(
                    "Health check thresholds must be > 0".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.name.as_str()) {
                return Err(MeshError::Config(format!(
                    "Duplicate service name: {}",
                    service.name
                )));
            }
        }

        Ok(())
    }
}
