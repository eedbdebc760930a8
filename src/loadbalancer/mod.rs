pub mod strategies;

use crate::registry::{Instance, ServiceRegistry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strategies::LoadBalancingStrategy;
use thiserror::Error;
use tracing::debug;

/// No healthy instance is registered for a service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No healthy instance available for service: {service}")]
pub struct NoHealthyInstance {
    pub service: String,
}

/// Load balancer for distributing calls across a service's healthy instances
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    /// Instance source
    registry: ServiceRegistry,
    /// Load balancing strategy
    strategy: LoadBalancingStrategy,
    /// Rotating cursor per service
    cursors: Arc<DashMap<String, Arc<AtomicUsize>>>,
    /// In-flight calls per (service, instance id)
    in_flight: Arc<DashMap<(String, String), Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    /// Create a new load balancer over a registry
    pub fn new(registry: ServiceRegistry, strategy: LoadBalancingStrategy) -> Self {
        Self {
            registry,
            strategy,
            cursors: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Select a healthy instance for a service
    pub fn select(&self, service: &str) -> Result<Instance, NoHealthyInstance> {
        let snapshot = self.registry.healthy_instances(service);
        let cursor = self.cursor(service);

        let index = self
            .strategy
            .select(&snapshot, &cursor, |instance| {
                self.outstanding(service, &instance.id)
            })
            .ok_or_else(|| NoHealthyInstance {
                service: service.to_string(),
            })?;

        let instance = snapshot[index].clone();
        debug!(
            service = %service,
            instance = %instance.id,
            healthy_count = snapshot.len(),
            strategy = %self.strategy,
            "Selected instance"
        );
        Ok(instance)
    }

    /// Count a call as in flight until the returned guard is dropped
    pub fn track(&self, service: &str, instance: &Instance) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry((service.to_string(), instance.id.clone()))
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }

    /// Calls currently in flight to an instance
    pub fn outstanding(&self, service: &str, instance_id: &str) -> usize {
        self.in_flight
            .get(&(service.to_string(), instance_id.to_string()))
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop the in-flight counter of a removed instance
    pub fn forget_instance(&self, service: &str, instance_id: &str) {
        self.in_flight
            .remove(&(service.to_string(), instance_id.to_string()));
    }

    /// Drop all selection state of a removed service
    pub fn forget(&self, service: &str) {
        self.cursors.remove(service);
        self.in_flight.retain(|(svc, _), _| svc != service);
    }

    fn cursor(&self, service: &str) -> Arc<AtomicUsize> {
        if let Some(cursor) = self.cursors.get(service) {
            return cursor.clone();
        }
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}

/// Decrements an instance's in-flight count on drop
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
