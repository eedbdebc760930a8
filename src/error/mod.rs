use thiserror::Error;

/// Result type for mesh control-plane operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Mesh control-plane error types
///
/// Request routing never produces these; it resolves to an
/// [`Outcome`](crate::mesh::Outcome) instead.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid service configuration: {0}")]
    InvalidService(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service already registered: {0}")]
    ServiceAlreadyRegistered(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
