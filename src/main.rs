use anyhow::Context;
use async_trait::async_trait;
use mesh_core::healthcheck::TcpConnectProbe;
use mesh_core::metrics::PrometheusCollector;
use mesh_core::registry::Instance;
use mesh_core::{
    init_tracing, Handler, HandlerError, MeshConfig, MeshCore, MeshRequest, RequestContext,
    ServiceMesh,
};
use serde_json::{json, Value};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const REQUESTS_PER_SERVICE: u64 = 5;

/// Stand-in transport: every third call fails with a transient error
#[derive(Default)]
struct SimulatedHandler {
    calls: AtomicU64,
}

#[async_trait]
impl Handler for SimulatedHandler {
    async fn dispatch(
        &self,
        instance: &Instance,
        request: &RequestContext,
    ) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(5)).await;

        if call % 3 == 2 {
            return Err(HandlerError::new(format!(
                "{} reset the connection",
                instance.address
            )));
        }

        Ok(json!({
            "served_by": instance.id,
            "attempt": request.attempt,
            "echo": request.payload(),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/mesh.yaml".to_string());

    let config = MeshConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let collector = Arc::new(PrometheusCollector::install()?);
    let mesh = MeshCore::from_config(
        &config,
        Arc::new(SimulatedHandler::default()),
        collector.clone(),
    )?;
    mesh.start_health_checks(config.health_check.clone(), Arc::new(TcpConnectProbe))?;

    let mut services = mesh.services();
    services.sort();

    for service in &services {
        for sequence in 0..REQUESTS_PER_SERVICE {
            let request = MeshRequest::new(service, json!({ "sequence": sequence }));
            let outcome = mesh.handle_request(request).await;
            info!(service = %service, sequence, outcome = %outcome, "Request completed");
        }

        if let Some(counters) = mesh.breaker_metrics(service) {
            info!(
                service = %service,
                successful = counters.successful_requests,
                failed = counters.failed_requests,
                rejected = counters.rejected_requests,
                "Circuit breaker counters"
            );
        }
    }

    let health = mesh.health_check().await;
    info!(
        healthy = health.is_healthy(),
        report = %serde_json::to_string(&health)?,
        "Mesh health"
    );

    println!("{}", collector.render());

    mesh.shutdown().await;
    Ok(())
}
