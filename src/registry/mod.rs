pub mod instance;

pub use instance::{Instance, InstanceConfig};

use crate::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Live instances per logical service
///
/// Each service's instance set is mutated while holding its map entry, and
/// snapshots are cloned under the same entry guard, so a reader sees the set
/// either before or after a mutation, never in between.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<DashMap<String, Vec<Instance>>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance to a service, marking it healthy.
    ///
    /// Re-registering an existing id refreshes its address and timestamp.
    /// Returns `true` when the instance was not present before.
    pub fn register(&self, instance: Instance, service: &str) -> bool {
        let mut entry = self.services.entry(service.to_string()).or_default();

        let added = match entry.iter_mut().find(|existing| existing.id == instance.id) {
            Some(existing) => {
                existing.address = instance.address;
                existing.healthy = true;
                existing.touch();
                debug!(service = %service, instance = %existing.id, "Instance re-registered");
                false
            }
            None => {
                info!(
                    service = %service,
                    instance = %instance.id,
                    address = %instance.address,
                    "Instance registered"
                );
                entry.push(Instance {
                    healthy: true,
                    ..instance
                });
                true
            }
        };

        metrics::record_healthy_instances(service, healthy_count(&entry));
        added
    }

    /// Remove an instance from a service. Absent instances are a no-op.
    pub fn deregister(&self, instance_id: &str, service: &str) -> Option<Instance> {
        let mut entry = self.services.get_mut(service)?;
        let position = entry.iter().position(|i| i.id == instance_id)?;
        let removed = entry.remove(position);

        info!(service = %service, instance = %instance_id, "Instance deregistered");
        metrics::record_healthy_instances(service, healthy_count(&entry));
        Some(removed)
    }

    /// Mark an instance unhealthy in every service that has it
    pub fn mark_unhealthy(&self, instance_id: &str) -> bool {
        self.set_health_everywhere(instance_id, false)
    }

    /// Mark an instance healthy in every service that has it
    pub fn mark_healthy(&self, instance_id: &str) -> bool {
        self.set_health_everywhere(instance_id, true)
    }

    /// Set the health flag of one instance of one service
    pub fn set_health(&self, service: &str, instance_id: &str, healthy: bool) -> bool {
        let Some(mut entry) = self.services.get_mut(service) else {
            return false;
        };

        let changed = match entry.iter_mut().find(|i| i.id == instance_id) {
            Some(instance) => {
                if instance.healthy != healthy {
                    debug!(
                        service = %service,
                        instance = %instance_id,
                        healthy,
                        "Instance health changed"
                    );
                }
                instance.healthy = healthy;
                true
            }
            None => false,
        };

        if changed {
            metrics::record_healthy_instances(service, healthy_count(&entry));
        }
        changed
    }

    fn set_health_everywhere(&self, instance_id: &str, healthy: bool) -> bool {
        let mut found = false;

        for mut entry in self.services.iter_mut() {
            let service = entry.key().clone();
            if let Some(instance) = entry.value_mut().iter_mut().find(|i| i.id == instance_id) {
                instance.healthy = healthy;
                found = true;
                debug!(
                    service = %service,
                    instance = %instance_id,
                    healthy,
                    "Instance health changed"
                );
                metrics::record_healthy_instances(&service, healthy_count(entry.value()));
            }
        }

        found
    }

    /// Snapshot of the healthy instances of a service, in registration order.
    ///
    /// Unknown services yield an empty list.
    pub fn healthy_instances(&self, service: &str) -> Vec<Instance> {
        self.services
            .get(service)
            .map(|entry| entry.iter().filter(|i| i.healthy).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every instance of a service, healthy or not
    pub fn instances(&self, service: &str) -> Vec<Instance> {
        self.services
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Healthy and total instance counts for a service
    pub fn counts(&self, service: &str) -> (usize, usize) {
        self.services
            .get(service)
            .map(|entry| (healthy_count(&entry), entry.len()))
            .unwrap_or((0, 0))
    }

    /// Refresh an instance's `last_seen`
    pub fn heartbeat(&self, service: &str, instance_id: &str) -> bool {
        let Some(mut entry) = self.services.get_mut(service) else {
            return false;
        };

        match entry.iter_mut().find(|i| i.id == instance_id) {
            Some(instance) => {
                instance.touch();
                true
            }
            None => false,
        }
    }

    /// Remove instances not seen within `max_age`, returning them with their service
    pub fn evict_stale(&self, max_age: Duration) -> Vec<(String, Instance)> {
        let mut evicted = Vec::new();

        for mut entry in self.services.iter_mut() {
            let service = entry.key().clone();
            let instances = entry.value_mut();
            let before = instances.len();

            let (stale, fresh): (Vec<_>, Vec<_>) = instances
                .drain(..)
                .partition(|instance| instance.age() > max_age);
            *instances = fresh;

            if instances.len() != before {
                info!(service = %service, evicted = stale.len(), "Evicted stale instances");
                metrics::record_healthy_instances(&service, healthy_count(instances));
            }

            evicted.extend(stale.into_iter().map(|instance| (service.clone(), instance)));
        }

        evicted
    }

    /// Names of all known services
    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop a service and all of its instances, returning how many were removed
    pub fn remove_service(&self, service: &str) -> usize {
        match self.services.remove(service) {
            Some((_, instances)) => {
                info!(
                    service = %service,
                    instances = instances.len(),
                    "Service removed from registry"
                );
                instances.len()
            }
            None => 0,
        }
    }
}

fn healthy_count(instances: &[Instance]) -> usize {
    instances.iter().filter(|i| i.healthy).count()
}
