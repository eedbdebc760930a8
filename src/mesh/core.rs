use super::cancel::Cancellation;
use super::handler::{Handler, RequestContext};
use super::outcome::{FailureReason, MeshRequest, Outcome, RejectReason};
use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState, RetryPolicy,
};
use crate::config::{MeshConfig, RouterConfig, ServiceConfig};
use crate::error::{MeshError, Result};
use crate::healthcheck::{HealthCheckConfig, HealthChecker, HealthProbe};
use crate::loadbalancer::LoadBalancer;
use crate::metrics::{self, MetricsCollector};
use crate::registry::{Instance, ServiceRegistry};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mesh capability: route requests and manage the set of logical services
#[async_trait]
pub trait ServiceMesh: Send + Sync {
    /// Route a request to a healthy instance of its service
    async fn handle_request(&self, request: MeshRequest) -> Outcome;

    /// Register a logical service and its seed instances
    async fn register_service(&self, config: ServiceConfig) -> Result<()>;

    /// Remove a logical service, its instances and its breaker
    async fn deregister_service(&self, service: &str) -> Result<()>;

    /// Report breaker state and instance counts per service
    async fn health_check(&self) -> MeshHealth;
}

/// Health of one logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub circuit_state: CircuitState,
    pub healthy_instances: usize,
    pub total_instances: usize,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.circuit_state != CircuitState::Open && self.healthy_instances > 0
    }
}

/// Health of the whole mesh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshHealth {
    pub services: Vec<ServiceHealth>,
}

impl MeshHealth {
    pub fn is_healthy(&self) -> bool {
        self.services.iter().all(ServiceHealth::is_healthy)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceHealth> {
        self.services.iter().find(|s| s.service == name)
    }
}

/// Registered service with its breaker and retry policy.
///
/// The entry is the only owner of the breaker, so a service registered
/// again under the same name always starts with a fresh one.
struct ServiceEntry {
    config: ServiceConfig,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

struct HealthTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Result of a single dispatch
enum Attempt {
    Success(Value),
    Failed {
        reason: FailureReason,
        retryable: bool,
    },
    Cancelled,
}

/// Releases a won half-open probe unless feedback was recorded
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl<'a> ProbeGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: Option<u64>) -> Self {
        Self {
            breaker,
            generation,
        }
    }

    fn resolve(&mut self) {
        self.generation = None;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            self.breaker.release_probe(generation);
        }
    }
}

/// The mesh control core: registry, breakers, load balancer and router
pub struct MeshCore {
    settings: RouterConfig,
    services: DashMap<String, Arc<ServiceEntry>>,
    registry: ServiceRegistry,
    balancer: LoadBalancer,
    handler: Arc<dyn Handler>,
    collector: Arc<dyn MetricsCollector>,
    health_task: Mutex<Option<HealthTask>>,
}

impl std::fmt::Debug for MeshCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCore")
            .field("settings", &self.settings)
            .field("services", &self.services.len())
            .field("handler", &"<dyn Handler>")
            .field("collector", &"<dyn MetricsCollector>")
            .finish()
    }
}

impl MeshCore {
    /// Create an empty mesh
    pub fn new(
        settings: RouterConfig,
        handler: Arc<dyn Handler>,
        collector: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        settings.validate()?;

        let registry = ServiceRegistry::new();
        let balancer = LoadBalancer::new(registry.clone(), settings.load_balancing);

        Ok(Self {
            settings,
            services: DashMap::new(),
            registry,
            balancer,
            handler,
            collector,
            health_task: Mutex::new(None),
        })
    }

    /// Build a mesh from configuration, registering every configured service
    pub fn from_config(
        config: &MeshConfig,
        handler: Arc<dyn Handler>,
        collector: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;

        let mesh = Self::new(config.router.clone(), handler, collector)?;
        for service in &config.services {
            mesh.add_service(service.clone())?;
        }

        info!(
            services = config.services.len(),
            strategy = %config.router.load_balancing,
            "Mesh core initialized"
        );
        Ok(mesh)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Configuration of a registered service
    pub fn service_config(&self, service: &str) -> Option<ServiceConfig> {
        self.services.get(service).map(|e| e.config.clone())
    }

    /// Names of all registered services
    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Add an instance to a registered service
    pub fn register_instance(&self, service: &str, instance: Instance) -> Result<bool> {
        // Held until the instance is in, so a concurrent deregistration
        // either sees it or runs first and makes this fail.
        let Some(_entry) = self.services.get(service) else {
            return Err(MeshError::ServiceNotFound(service.to_string()));
        };
        Ok(self.registry.register(instance, service))
    }

    /// Remove an instance from a service
    pub fn deregister_instance(&self, service: &str, instance_id: &str) -> bool {
        let removed = self.registry.deregister(instance_id, service).is_some();
        if removed {
            self.balancer.forget_instance(service, instance_id);
        }
        removed
    }

    /// Mark an instance healthy wherever it is registered
    pub fn mark_instance_healthy(&self, instance_id: &str) -> bool {
        self.registry.mark_healthy(instance_id)
    }

    /// Mark an instance unhealthy wherever it is registered
    pub fn mark_instance_unhealthy(&self, instance_id: &str) -> bool {
        self.registry.mark_unhealthy(instance_id)
    }

    /// Breaker snapshot of a registered service
    pub fn breaker_state(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        self.services.get(service).map(|entry| entry.breaker.snapshot())
    }

    /// Breaker counters of a registered service
    pub fn breaker_metrics(&self, service: &str) -> Option<CircuitBreakerMetrics> {
        self.services.get(service).map(|entry| entry.breaker.metrics())
    }

    /// Start probing every registered instance in the background.
    ///
    /// A disabled config is a no-op.
    pub fn start_health_checks(
        &self,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<()> {
        if !config.enabled {
            info!("Active health checks disabled");
            return Ok(());
        }

        let mut task = self.health_task.lock();
        if task.is_some() {
            return Err(MeshError::Internal(
                "Health checks are already running".to_string(),
            ));
        }

        let checker = Arc::new(HealthChecker::new(config, self.registry.clone(), probe));
        let (shutdown, rx) = watch::channel(false);
        let handle = checker.spawn(rx);
        *task = Some(HealthTask { shutdown, handle });
        Ok(())
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.shutdown.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Health check task ended abnormally");
            }
        }
        info!("Mesh core shut down");
    }

    fn add_service(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;

        let name = config.name.clone();
        let seeds = config.instances.clone();

        let Entry::Vacant(vacant) = self.services.entry(name.clone()) else {
            return Err(MeshError::ServiceAlreadyRegistered(name));
        };

        // Seeds go in while the vacant slot is still locked
        for seed in seeds {
            self.registry.register(Instance::from(seed), &name);
        }

        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            config.circuit_breaker.clone(),
        ));
        let retry = RetryPolicy::new(config.retry.clone());
        vacant.insert(Arc::new(ServiceEntry {
            config,
            breaker,
            retry,
        }));

        info!(service = %name, "Service registered");
        Ok(())
    }

    fn remove_service(&self, service: &str) -> Result<()> {
        let Entry::Occupied(occupied) = self.services.entry(service.to_string()) else {
            return Err(MeshError::ServiceNotFound(service.to_string()));
        };

        // Clear instances and selection state before the name is free again
        self.registry.remove_service(service);
        self.balancer.forget(service);
        occupied.remove();

        info!(service = %service, "Service deregistered");
        Ok(())
    }

    /// Route a request, giving up when `cancellation` fires
    pub async fn handle_request_with(
        &self,
        request: MeshRequest,
        cancellation: Cancellation,
    ) -> Outcome {
        let service = request.service;

        let Some(entry) = self.services.get(&service).map(|e| e.value().clone()) else {
            warn!(service = %service, "Request for unknown service");
            let outcome = Outcome::Rejected(RejectReason::UnknownService);
            self.observe(&service, &outcome, Duration::ZERO);
            return outcome;
        };

        let mut ctx = RequestContext::new(service.clone(), request.payload, cancellation);
        let mut backoff = entry.retry.schedule();
        let mut attempt: u32 = 0;

        loop {
            if ctx.cancellation.is_cancelled() {
                return self.cancelled(&service, Duration::ZERO);
            }

            ctx.attempt = attempt;
            let started = Instant::now();

            let admission = entry.breaker.allow();
            if !admission.is_allowed() {
                debug!(service = %service, attempt, "Circuit open, rejecting request");
                let outcome = Outcome::Rejected(RejectReason::CircuitOpen);
                self.observe(&service, &outcome, started.elapsed());
                return outcome;
            }
            let mut probe = ProbeGuard::new(&entry.breaker, admission.probe());

            let instance = match self.balancer.select(&service) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(service = %service, attempt, error = %e, "No instance to dispatch to");
                    let outcome = Outcome::Failure(FailureReason::NoInstance);
                    self.observe(&service, &outcome, started.elapsed());
                    return outcome;
                }
            };

            let result = {
                let _in_flight = self.balancer.track(&service, &instance);
                self.dispatch(&instance, &ctx).await
            };
            let latency = started.elapsed();

            let (reason, retryable) = match result {
                Attempt::Success(response) => {
                    entry.breaker.record_success();
                    probe.resolve();
                    debug!(
                        service = %service,
                        instance = %instance.id,
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "Request succeeded"
                    );
                    let outcome = Outcome::Success(response);
                    self.observe(&service, &outcome, latency);
                    return outcome;
                }
                Attempt::Cancelled => {
                    debug!(
                        service = %service,
                        instance = %instance.id,
                        attempt,
                        "Request cancelled during dispatch"
                    );
                    return self.cancelled(&service, latency);
                }
                Attempt::Failed { reason, retryable } => (reason, retryable),
            };

            if reason == FailureReason::Timeout {
                entry.breaker.record_timeout();
            } else {
                entry.breaker.record_failure();
            }
            probe.resolve();
            drop(probe);

            warn!(
                service = %service,
                instance = %instance.id,
                attempt,
                error = %reason,
                "Request attempt failed"
            );
            self.observe(&service, &Outcome::Failure(reason.clone()), latency);

            if !retryable {
                return Outcome::Failure(reason);
            }

            if !entry.retry.has_attempts_left(attempt) {
                let attempts = attempt + 1;
                warn!(service = %service, attempts, "Retries exhausted");
                return Outcome::Failure(FailureReason::ExhaustedRetries {
                    attempts,
                    last: Box::new(reason),
                });
            }

            let delay = backoff.next_delay();
            metrics::record_backoff(&service, delay);
            debug!(
                service = %service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => {
                    return self.cancelled(&service, Duration::ZERO);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Run the handler on its own task under the attempt timeout.
    ///
    /// A timed-out task is aborted; a cancelled one is left to finish.
    async fn dispatch(&self, instance: &Instance, ctx: &RequestContext) -> Attempt {
        let handler = self.handler.clone();
        let task_instance = instance.clone();
        let task_ctx = ctx.clone();
        let mut task =
            tokio::spawn(async move { handler.dispatch(&task_instance, &task_ctx).await });

        let attempt_timeout = self.settings.attempt_timeout();
        let joined = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => None,
            joined = tokio::time::timeout(attempt_timeout, &mut task) => Some(joined),
        };

        let Some(joined) = joined else {
            return Attempt::Cancelled;
        };

        match joined {
            Ok(Ok(Ok(response))) => Attempt::Success(response),
            Ok(Ok(Err(e))) => Attempt::Failed {
                reason: FailureReason::HandlerError(e.reason),
                retryable: e.retryable,
            },
            Ok(Err(e)) => Attempt::Failed {
                reason: FailureReason::HandlerError(format!("handler task failed: {}", e)),
                retryable: true,
            },
            Err(_) => {
                task.abort();
                Attempt::Failed {
                    reason: FailureReason::Timeout,
                    retryable: true,
                }
            }
        }
    }

    fn cancelled(&self, service: &str, latency: Duration) -> Outcome {
        let outcome = Outcome::Failure(FailureReason::Cancelled);
        self.observe(service, &outcome, latency);
        outcome
    }

    fn observe(&self, service: &str, outcome: &Outcome, latency: Duration) {
        if let Err(e) = self.collector.observe(service, outcome, latency) {
            debug!(service = %service, error = %e, "Dropped metrics observation");
        }
    }
}

impl Drop for MeshCore {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[async_trait]
impl ServiceMesh for MeshCore {
    async fn handle_request(&self, request: MeshRequest) -> Outcome {
        self.handle_request_with(request, Cancellation::never()).await
    }

    async fn register_service(&self, config: ServiceConfig) -> Result<()> {
        self.add_service(config)
    }

    async fn deregister_service(&self, service: &str) -> Result<()> {
        self.remove_service(service)
    }

    async fn health_check(&self) -> MeshHealth {
        let mut services: Vec<ServiceHealth> = self
            .services
            .iter()
            .map(|entry| {
                let (healthy_instances, total_instances) = self.registry.counts(entry.key());
                ServiceHealth {
                    service: entry.key().clone(),
                    circuit_state: entry.breaker.state(),
                    healthy_instances,
                    total_instances,
                }
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        MeshHealth { services }
    }
}
