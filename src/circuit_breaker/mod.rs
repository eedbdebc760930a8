pub mod breaker;
pub mod retry;
pub mod types;

pub use breaker::CircuitBreaker;
pub use retry::{BackoffSchedule, RetryPolicy};
pub use types::{
    Admission, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState,
    RetryConfig,
};
