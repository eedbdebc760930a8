use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound logical-service request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshRequest {
    /// Target logical service
    pub service: String,
    /// Opaque payload handed to the handler
    #[serde(default)]
    pub payload: Value,
}

impl MeshRequest {
    pub fn new(service: impl Into<String>, payload: Value) -> Self {
        Self {
            service: service.into(),
            payload,
        }
    }
}

/// Why a request was not attempted at all
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("circuit open")]
    CircuitOpen,

    #[error("unknown service")]
    UnknownService,
}

/// Why a request, or one attempt of it, failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("no healthy instance")]
    NoInstance,

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("attempt timed out")]
    Timeout,

    #[error("retries exhausted after {attempts} attempts, last error: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<FailureReason>,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Terminal result of routing a request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned a response
    Success(Value),
    /// The mesh tried and failed
    Failure(FailureReason),
    /// The mesh did not try; the handler was never called
    Rejected(RejectReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    /// Response value of a successful outcome
    pub fn response(&self) -> Option<&Value> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Stable label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure(FailureReason::NoInstance) => "no_instance",
            Outcome::Failure(FailureReason::HandlerError(_)) => "handler_error",
            Outcome::Failure(FailureReason::Timeout) => "timeout",
            Outcome::Failure(FailureReason::ExhaustedRetries { .. }) => "exhausted_retries",
            Outcome::Failure(FailureReason::Cancelled) => "cancelled",
            Outcome::Rejected(RejectReason::CircuitOpen) => "circuit_open",
            Outcome::Rejected(RejectReason::UnknownService) => "unknown_service",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(_) => write!(f, "success"),
            Outcome::Failure(reason) => write!(f, "failure: {}", reason),
            Outcome::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}
