pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod mesh;
pub mod metrics;
pub mod registry;

pub use config::{MeshConfig, RouterConfig, ServiceConfig};
pub use error::{MeshError, Result};
pub use mesh::{
    Cancellation, FailureReason, Handler, HandlerError, MeshCore, MeshHealth, MeshRequest,
    Outcome, RejectReason, RequestContext, ServiceMesh,
};

/// Initialize tracing/logging
///
/// Set `MESH_LOG_FORMAT=json` for structured JSON output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mesh_core=debug".into());

    let json = std::env::var("MESH_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
