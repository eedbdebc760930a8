use super::types::RetryConfig;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Retry budget and backoff schedule for one service
///
/// The delay slept after failed attempt `n` (starting at 0) is
/// `base_backoff * backoff_factor^n`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total number of attempts a request may make
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts()
    }

    /// Whether another attempt may follow the (0-based) attempt that just failed
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts()
    }

    /// Start a fresh backoff schedule for one request
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            inner: self.create_backoff(),
            max: self.config.max_backoff(),
        }
    }

    /// The delays a request would sleep if every attempt failed
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = self.schedule();
        (0..self.config.max_retries)
            .map(|_| schedule.next_delay())
            .collect()
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.base_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_multiplier(self.config.backoff_factor)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max retries manually
            .build()
    }
}

/// Per-request iterator over backoff delays
#[derive(Debug)]
pub struct BackoffSchedule {
    inner: ExponentialBackoff,
    max: Duration,
}

impl BackoffSchedule {
    /// Delay to sleep before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        // Without a max elapsed time the schedule never runs dry
        self.inner.next_backoff().unwrap_or(self.max)
    }
}
