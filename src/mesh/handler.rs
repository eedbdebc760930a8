use super::cancel::Cancellation;
use crate::registry::Instance;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a handler for one dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure worth retrying
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away by retrying
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Per-attempt view of an inbound request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub service: String,
    pub payload: Arc<Value>,
    /// Zero-based attempt number
    pub attempt: u32,
    /// Fires when the caller gives up on the request
    pub cancellation: Cancellation,
}

impl RequestContext {
    pub fn new(service: String, payload: Value, cancellation: Cancellation) -> Self {
        Self {
            service,
            payload: Arc::new(payload),
            attempt: 0,
            cancellation,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Executes a routed request against a selected instance
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn dispatch(
        &self,
        instance: &Instance,
        request: &RequestContext,
    ) -> Result<Value, HandlerError>;
}
