use crate::registry::{Instance, ServiceRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Enable active health checks
    #[serde(default)]
    pub enabled: bool,
    /// Interval between probe rounds in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Probe timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Number of consecutive failures before marking unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: usize,
    /// Number of consecutive successes before marking healthy
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: usize,
    /// Evict instances not seen for this long, in milliseconds
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

fn default_interval() -> u64 {
    10_000
}

fn default_timeout() -> u64 {
    2_000
}

fn default_unhealthy_threshold() -> usize {
    3
}

fn default_healthy_threshold() -> usize {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval(),
            timeout_ms: default_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
            stale_after_ms: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }
}

/// Liveness probe for a single instance
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, instance: &Instance) -> bool;
}

/// Probe that succeeds when a TCP connection to the instance address opens
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectProbe;

#[async_trait]
impl HealthProbe for TcpConnectProbe {
    async fn probe(&self, instance: &Instance) -> bool {
        match TcpStream::connect(&instance.address).await {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    instance = %instance.id,
                    address = %instance.address,
                    error = %e,
                    "TCP probe failed"
                );
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct Streak {
    successes: usize,
    failures: usize,
}

/// Active health checker flipping instance health in the registry
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: ServiceRegistry,
    probe: Arc<dyn HealthProbe>,
    /// Consecutive probe results per (service, instance id)
    streaks: DashMap<(String, String), Streak>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("probe", &"<dyn HealthProbe>")
            .finish()
    }
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(
        config: HealthCheckConfig,
        registry: ServiceRegistry,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            streaks: DashMap::new(),
        }
    }

    /// Get health check configuration
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Run one probe round over every registered instance.
    ///
    /// Returns the number of instances whose health flag flipped.
    pub async fn check_once(&self) -> usize {
        if let Some(max_age) = self.config.stale_after() {
            for (service, instance) in self.registry.evict_stale(max_age) {
                warn!(
                    service = %service,
                    instance = %instance.id,
                    "Evicted stale instance"
                );
            }
        }

        let targets: Vec<(String, Instance)> = self
            .registry
            .services()
            .into_iter()
            .flat_map(|service| {
                let instances = self.registry.instances(&service);
                instances
                    .into_iter()
                    .map(move |instance| (service.clone(), instance))
            })
            .collect();

        let live: HashSet<(String, String)> = targets
            .iter()
            .map(|(service, instance)| (service.clone(), instance.id.clone()))
            .collect();
        self.streaks.retain(|key, _| live.contains(key));

        let timeout = self.config.timeout();
        let results = join_all(targets.iter().map(|(_, instance)| async move {
            tokio::time::timeout(timeout, self.probe.probe(instance))
                .await
                .unwrap_or(false)
        }))
        .await;

        targets
            .iter()
            .zip(results)
            .filter(|((service, instance), success)| self.record(service, instance, *success))
            .count()
    }

    /// Apply one probe result. Returns whether the instance's health flipped.
    fn record(&self, service: &str, instance: &Instance, success: bool) -> bool {
        let flip = {
            let mut streak = self
                .streaks
                .entry((service.to_string(), instance.id.clone()))
                .or_default();

            if success {
                streak.successes += 1;
                streak.failures = 0;
                !instance.healthy && streak.successes >= self.config.healthy_threshold
            } else {
                streak.failures += 1;
                streak.successes = 0;
                instance.healthy && streak.failures >= self.config.unhealthy_threshold
            }
        };

        if success {
            self.registry.heartbeat(service, &instance.id);
        }

        if !flip {
            return false;
        }

        self.registry.set_health(service, &instance.id, success);
        if success {
            info!(service = %service, instance = %instance.id, "Instance recovered");
        } else {
            warn!(
                service = %service,
                instance = %instance.id,
                failures = self.config.unhealthy_threshold,
                "Instance marked unhealthy"
            );
        }
        true
    }

    /// Probe every interval until `shutdown` flips to true or its sender drops
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_ms = self.config.interval_ms,
                "Started active health checks"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let changed = self.check_once().await;
                        if changed > 0 {
                            debug!(changed, "Health check round changed instance health");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Stopped active health checks");
        })
    }
}
