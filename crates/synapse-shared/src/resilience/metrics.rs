//! # Circuit Breaker Metrics
//!
//! Snapshot counters for monitoring breaker behavior; surfaced through the
//! admin status endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Current consecutive failure count
    pub consecutive_failures: u64,
    /// Total duration of all operations
    pub total_duration: Duration,
    pub current_state: CircuitState,
    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_states() {
        let mut metrics = CircuitBreakerMetrics {
            total_calls: 10,
            success_count: 10,
            failure_count: 0,
            consecutive_failures: 0,
            total_duration: Duration::from_millis(100),
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 1.0,
            average_duration: Duration::from_millis(10),
        };
        assert!(metrics.is_healthy());

        metrics.current_state = CircuitState::Open;
        assert!(!metrics.is_healthy());

        metrics.current_state = CircuitState::HalfOpen;
        assert!(metrics.is_healthy());
    }
}
