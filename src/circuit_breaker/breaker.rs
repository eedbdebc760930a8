use super::types::{
    Admission, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerSnapshot, CircuitState,
};
use crate::metrics;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker for a single logical service
///
/// All transitions happen under one lock that is never held across an
/// `.await`, so concurrent admission checks observe them atomically.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state
    state: Mutex<State>,
    /// Service name
    service: String,
}

#[derive(Debug)]
struct State {
    /// Current circuit state
    circuit_state: CircuitState,
    /// Number of consecutive failures in closed state
    consecutive_failures: u32,
    /// Whether the single half-open probe is still unresolved
    probe_in_flight: bool,
    /// Generation of the latest half-open probe
    probe_generation: u64,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    /// Metrics
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(service: String, config: CircuitBreakerConfig) -> Self {
        info!(
            service = %service,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout_ms,
            "Creating circuit breaker"
        );

        Self {
            config,
            state: Mutex::new(State {
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
                probe_generation: 0,
                opened_at: None,
                metrics: CircuitBreakerMetrics::default(),
            }),
            service,
        }
    }

    /// Check whether a call may proceed
    pub fn allow(&self) -> Admission {
        let mut state = self.state.lock();

        match state.circuit_state {
            CircuitState::Closed => {
                state.metrics.total_requests += 1;
                Admission::Allowed { probe: None }
            }
            CircuitState::Open => {
                let opened_at = match state.opened_at {
                    Some(opened_at) => opened_at,
                    None => {
                        // Recover from a missing timestamp by restarting the window
                        warn!(service = %self.service, "Circuit open but no opened_at timestamp");
                        let now = Instant::now();
                        state.opened_at = Some(now);
                        now
                    }
                };

                if opened_at.elapsed() >= self.config.recovery_timeout() {
                    self.transition_to_half_open(&mut state);
                    state.probe_in_flight = true;
                    state.probe_generation += 1;
                    state.metrics.total_requests += 1;
                    Admission::Allowed {
                        probe: Some(state.probe_generation),
                    }
                } else {
                    state.metrics.rejected_requests += 1;
                    let remaining = self
                        .config
                        .recovery_timeout()
                        .saturating_sub(opened_at.elapsed());
                    debug!(
                        service = %self.service,
                        time_remaining = ?remaining,
                        "Circuit breaker open, rejecting request"
                    );
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                // The probe is still unresolved; everyone else waits for it
                state.metrics.rejected_requests += 1;
                debug!(service = %self.service, "Half-open probe in flight, rejecting");
                Admission::Rejected
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.metrics.successful_requests += 1;

        match state.circuit_state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                debug!(service = %self.service, "Half-open probe request succeeded");
                self.transition_to_closed(&mut state);
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit opened
                debug!(service = %self.service, "Recording success in open state");
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.metrics.failed_requests += 1;

        match state.circuit_state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                debug!(
                    service = %self.service,
                    consecutive_failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Request failed in closed state"
                );

                if state.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    service = %self.service,
                    "Half-open probe request failed, reopening circuit"
                );
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {
                debug!(service = %self.service, "Recording failure in open state");
            }
        }
    }

    /// Record a timeout
    pub fn record_timeout(&self) {
        self.state.lock().metrics.timeout_count += 1;
        self.record_failure();
    }

    /// Give back a probe that ended without feedback.
    ///
    /// `generation` is the one handed out by [`allow`](Self::allow). A release
    /// for any probe other than the one currently in flight is ignored.
    /// The circuit returns to Open with its previous `opened_at`, so the
    /// next admission check may promote a new probe straight away.
    pub fn release_probe(&self, generation: u64) {
        let mut state = self.state.lock();

        if state.circuit_state != CircuitState::HalfOpen
            || !state.probe_in_flight
            || state.probe_generation != generation
        {
            debug!(
                service = %self.service,
                generation,
                current = state.probe_generation,
                "Ignoring release of a stale probe"
            );
            return;
        }

        debug!(service = %self.service, generation, "Half-open probe abandoned, returning to open");
        state.circuit_state = CircuitState::Open;
        state.probe_in_flight = false;
        metrics::record_circuit_breaker_transition(
            &self.service,
            CircuitState::HalfOpen,
            CircuitState::Open,
        );
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit_state
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.state.lock().metrics.clone()
    }

    /// Get a consistent copy of the full breaker state
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: state.circuit_state,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at,
            probe_in_flight: state.probe_in_flight,
        }
    }

    /// Transition to open state
    fn transition_to_open(&self, state: &mut State) {
        info!(
            service = %self.service,
            consecutive_failures = state.consecutive_failures,
            "Circuit breaker opening"
        );

        metrics::record_circuit_breaker_transition(
            &self.service,
            state.circuit_state,
            CircuitState::Open,
        );
        state.circuit_state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.probe_in_flight = false;
        state.metrics.circuit_opened_count += 1;
    }

    /// Transition to half-open state
    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            service = %self.service,
            recovery_timeout = ?self.config.recovery_timeout(),
            "Circuit breaker transitioning to half-open"
        );

        metrics::record_circuit_breaker_transition(
            &self.service,
            state.circuit_state,
            CircuitState::HalfOpen,
        );
        state.circuit_state = CircuitState::HalfOpen;
        state.metrics.circuit_half_opened_count += 1;
    }

    /// Transition to closed state
    fn transition_to_closed(&self, state: &mut State) {
        info!(service = %self.service, "Circuit breaker closing");

        metrics::record_circuit_breaker_transition(
            &self.service,
            state.circuit_state,
            CircuitState::Closed,
        );
        state.circuit_state = CircuitState::Closed;
        state.opened_at = None;
        state.consecutive_failures = 0;
        state.probe_in_flight = false;
        state.metrics.circuit_closed_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn breaker(failure_threshold: u32, recovery_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-service".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout_ms,
            },
        )
    }

    fn open(cb: &CircuitBreaker, failures: u32) {
        for _ in 0..failures {
            assert!(cb.allow().is_allowed());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test-service".to_string(), CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.allow(), Admission::Allowed { probe: None });
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let cb = breaker(3, 60_000);
        open(&cb, 3);
        assert_eq!(cb.allow(), Admission::Rejected);
        assert!(cb.snapshot().opened_at.is_some());
    }

    #[test]
    fn test_circuit_resets_on_success() {
        let cb = breaker(3, 60_000);

        for _ in 0..2 {
            assert!(cb.allow().is_allowed());
            cb.record_failure();
        }
        assert_eq!(cb.snapshot().consecutive_failures, 2);

        assert!(cb.allow().is_allowed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);

        // Needs a full run of failures again
        for _ in 0..2 {
            assert!(cb.allow().is_allowed());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breaker(2, 0);
        open(&cb, 2);

        assert_eq!(cb.allow(), Admission::Allowed { probe: Some(1) });
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.snapshot().probe_in_flight);

        assert_eq!(cb.allow(), Admission::Rejected);
        assert_eq!(cb.allow(), Admission::Rejected);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let cb = breaker(2, 0);
        open(&cb, 2);

        assert!(cb.allow().is_probe());
        cb.record_success();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(!snapshot.probe_in_flight);
        assert!(snapshot.opened_at.is_none());
        assert_eq!(cb.allow(), Admission::Allowed { probe: None });
    }

    #[test]
    fn test_half_open_reopens_on_failure_with_fresh_timestamp() {
        let cb = breaker(2, 20);
        open(&cb, 2);
        let first_opened = cb.snapshot().opened_at.unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow().is_probe());
        cb.record_failure();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(!snapshot.probe_in_flight);
        assert!(snapshot.opened_at.unwrap() > first_opened);
        assert_eq!(cb.allow(), Admission::Rejected);
    }

    #[test]
    fn test_release_probe_returns_to_open() {
        let cb = breaker(1, 0);
        open(&cb, 1);

        let generation = cb.allow().probe().unwrap();
        cb.release_probe(generation);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.snapshot().probe_in_flight);

        // Still eligible, so a new probe is admitted
        assert_eq!(cb.allow().probe(), Some(generation + 1));
    }

    #[test]
    fn test_release_probe_ignored_outside_half_open() {
        let cb = breaker(3, 0);
        cb.release_probe(1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_release_keeps_half_open_slot() {
        let cb = breaker(1, 0);

        // Two calls admitted while closed; the second opens the circuit
        assert!(cb.allow().is_allowed());
        assert!(cb.allow().is_allowed());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let first = cb.allow().probe().unwrap();

        // The other closed-era call fails late and reopens the circuit
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let second = cb.allow().probe().unwrap();
        assert_ne!(first, second);

        // The first probe's caller gives up after it was superseded
        cb.release_probe(first);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.snapshot().probe_in_flight);
        assert_eq!(cb.allow(), Admission::Rejected);

        cb.release_probe(second);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow().is_probe());
    }

    #[test]
    fn test_concurrent_promotion_admits_one_probe() {
        let cb = Arc::new(breaker(1, 0));
        open(&cb, 1);

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let admitted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..threads {
                let cb = cb.clone();
                let barrier = barrier.clone();
                let admitted = admitted.clone();
                scope.spawn(move || {
                    barrier.wait();
                    if cb.allow().is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let cb = breaker(2, 60_000);
        cb.record_timeout();
        cb.record_timeout();

        assert_eq!(cb.state(), CircuitState::Open);
        let metrics = cb.metrics();
        assert_eq!(metrics.timeout_count, 2);
        assert_eq!(metrics.failed_requests, 2);
    }

    #[test]
    fn test_metrics_tracking() {
        let cb = breaker(2, 60_000);

        assert!(cb.allow().is_allowed());
        cb.record_success();

        assert!(cb.allow().is_allowed());
        cb.record_failure();

        assert!(cb.allow().is_allowed());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow().is_allowed());

        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.rejected_requests, 1);
        assert_eq!(metrics.circuit_opened_count, 1);
    }
}
