use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a single probe request is allowed through
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed. `probe` carries the generation of the
    /// half-open probe when this caller won the Open -> HalfOpen promotion.
    Allowed { probe: Option<u64> },
    /// The circuit is open (or a probe is already in flight)
    Rejected,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    pub fn is_probe(&self) -> bool {
        self.probe().is_some()
    }

    /// Generation of the won probe, if any
    pub fn probe(&self) -> Option<u64> {
        match self {
            Admission::Allowed { probe } => *probe,
            Admission::Rejected => None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time to stay open before admitting a half-open probe, in milliseconds
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential growth factor between consecutive backoff delays
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Backoff unit: the delay slept after the first failed attempt, in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for a single backoff delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Total number of attempts a request may make
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Number of admitted requests
    pub total_requests: u64,
    /// Number of successful requests
    pub successful_requests: u64,
    /// Number of failed requests (timeouts included)
    pub failed_requests: u64,
    /// Number of requests rejected by the breaker
    pub rejected_requests: u64,
    /// Number of timeouts
    pub timeout_count: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
}

/// Point-in-time copy of a breaker's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
}
