use crate::circuit_breaker::CircuitState;
use crate::error::{MeshError, Result};
use crate::mesh::Outcome;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error reported by a metrics collector. The router discards these.
#[derive(Error, Debug)]
#[error("Metrics collector error: {0}")]
pub struct MetricsError(pub String);

/// Sink for per-attempt request observations
///
/// Implementations must return promptly; the router calls this inline.
pub trait MetricsCollector: Send + Sync {
    fn observe(
        &self,
        service: &str,
        outcome: &Outcome,
        latency: Duration,
    ) -> std::result::Result<(), MetricsError>;
}

/// Collector that drops every observation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {
    fn observe(
        &self,
        _service: &str,
        _outcome: &Outcome,
        _latency: Duration,
    ) -> std::result::Result<(), MetricsError> {
        Ok(())
    }
}

/// Collector backed by the global `metrics` recorder, exposing Prometheus text
#[derive(Clone)]
pub struct PrometheusCollector {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for PrometheusCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusCollector")
            .field("handle", &"<PrometheusHandle>")
            .finish()
    }
}

impl PrometheusCollector {
    /// Install the Prometheus recorder process-wide.
    ///
    /// Fails if another recorder is already installed.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            MeshError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        register_metrics();

        info!("Metrics collector initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsCollector for PrometheusCollector {
    fn observe(
        &self,
        service: &str,
        outcome: &Outcome,
        latency: Duration,
    ) -> std::result::Result<(), MetricsError> {
        record_request(service, outcome.label(), latency);
        Ok(())
    }
}

/// Register all metrics with descriptions
fn register_metrics() {
    describe_counter!(
        "mesh_requests_total",
        "Total number of request attempts, by service and outcome"
    );
    describe_histogram!(
        "mesh_request_duration_seconds",
        "Request attempt latencies in seconds"
    );
    describe_histogram!(
        "mesh_retry_backoff_seconds",
        "Backoff delays slept between attempts"
    );
    describe_gauge!(
        "mesh_circuit_breaker_state",
        "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
    );
    describe_counter!(
        "mesh_circuit_breaker_transitions_total",
        "Total number of circuit breaker state transitions"
    );
    describe_gauge!(
        "mesh_instances_healthy",
        "Number of healthy instances per service"
    );

    debug!("All metrics registered with descriptions");
}

/// Record one request attempt
pub fn record_request(service: &str, outcome: &str, latency: Duration) {
    let labels = [
        ("service", service.to_string()),
        ("outcome", outcome.to_string()),
    ];

    counter!("mesh_requests_total", &labels).increment(1);
    histogram!("mesh_request_duration_seconds", &labels).record(latency.as_secs_f64());
}

/// Record a backoff sleep before a retry
pub fn record_backoff(service: &str, delay: Duration) {
    let labels = [("service", service.to_string())];
    histogram!("mesh_retry_backoff_seconds", &labels).record(delay.as_secs_f64());
}

/// Record a circuit breaker transition and the resulting state
pub fn record_circuit_breaker_transition(service: &str, from: CircuitState, to: CircuitState) {
    let labels = [
        ("service", service.to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
    ];
    counter!("mesh_circuit_breaker_transitions_total", &labels).increment(1);
    record_circuit_breaker_state(service, to);
}

/// Record circuit breaker state
pub fn record_circuit_breaker_state(service: &str, state: CircuitState) {
    let labels = [("service", service.to_string())];
    gauge!("mesh_circuit_breaker_state", &labels).set(state.as_gauge() as f64);
}

/// Record how many instances of a service are healthy
pub fn record_healthy_instances(service: &str, count: usize) {
    let labels = [("service", service.to_string())];
    gauge!("mesh_instances_healthy", &labels).set(count as f64);
}
