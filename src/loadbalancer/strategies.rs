use crate::registry::Instance;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin: rotate through healthy instances with a per-service cursor
    #[default]
    RoundRobin,
    /// Least outstanding requests: pick the instance with the fewest calls in
    /// flight, rotating among ties
    LeastOutstanding,
}

impl LoadBalancingStrategy {
    /// Select an index into `instances`.
    ///
    /// `cursor` is the service's rotation counter and is advanced exactly once
    /// per call; `outstanding` reports in-flight calls for an instance.
    pub fn select<F>(
        &self,
        instances: &[Instance],
        cursor: &AtomicUsize,
        outstanding: F,
    ) -> Option<usize>
    where
        F: Fn(&Instance) -> usize,
    {
        // Filter out unhealthy instances
        let healthy: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, instance)| instance.is_healthy())
            .map(|(index, _)| index)
            .collect();

        if healthy.is_empty() {
            return None;
        }

        let start = cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();

        match self {
            LoadBalancingStrategy::RoundRobin => Some(healthy[start]),
            LoadBalancingStrategy::LeastOutstanding => {
                Self::select_least_outstanding(instances, &healthy, start, outstanding)
            }
        }
    }

    /// Scan from the rotating start so equally loaded instances take turns
    fn select_least_outstanding<F>(
        instances: &[Instance],
        healthy: &[usize],
        start: usize,
        outstanding: F,
    ) -> Option<usize>
    where
        F: Fn(&Instance) -> usize,
    {
        (0..healthy.len())
            .map(|offset| healthy[(start + offset) % healthy.len()])
            .min_by_key(|&index| outstanding(&instances[index]))
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::LeastOutstanding => write!(f, "least_outstanding"),
        }
    }
}
