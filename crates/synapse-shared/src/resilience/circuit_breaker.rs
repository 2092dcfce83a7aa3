//! # Circuit Breaker
//!
//! Three-state breaker (Closed → Open → HalfOpen) with atomic counters.
//! All state lives in atomics plus one mutex-guarded transition instant, so
//! `should_allow` / `record_*` are cheap and callable from any task.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::metrics::CircuitBreakerMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls flow through
    Closed,
    /// Failing; calls are rejected until the recovery timeout elapses
    Open,
    /// Probing; limited calls allowed to test recovery
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Circuit breaker for a named component
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    half_open_successes: AtomicU64,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_duration_micros: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            consecutive_failures: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_duration_micros: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check whether the next call is allowed.
    ///
    /// Open circuits transition to HalfOpen once the recovery timeout has
    /// elapsed; the transitioning caller is granted the probe call.
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = {
                    let guard = self.opened_at.lock().unwrap_or_else(|p| p.into_inner());
                    guard.map(|at| at.elapsed())
                };
                if elapsed.is_some_and(|e| e >= self.config.timeout) {
                    self.transition(CircuitState::HalfOpen);
                    self.half_open_successes.store(0, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation with its duration
    pub fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= u64::from(self.config.success_threshold) {
                self.transition(CircuitState::Closed);
            }
        }
    }

    /// Record a failed operation with its duration
    pub fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed => {
                if failures >= u64::from(self.config.failure_threshold) {
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Emergency kill switch
    pub fn force_open(&self) {
        self.open();
    }

    /// Emergency recovery
    pub fn force_closed(&self) {
        self.transition(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Snapshot the breaker's counters for observability
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration = Duration::from_micros(self.total_duration_micros.load(Ordering::Relaxed));

        let (failure_rate, success_rate, average_duration) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                success_count as f64 / total_calls as f64,
                total_duration / total_calls as u32,
            )
        } else {
            (0.0, 0.0, Duration::ZERO)
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_duration,
            current_state: self.state(),
            failure_rate,
            success_rate,
            average_duration,
        }
    }

    fn open(&self) {
        self.transition(CircuitState::Open);
        let mut guard = self.opened_at.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Instant::now());
    }

    fn transition(&self, to: CircuitState) {
        let from = CircuitState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        if from != to {
            match to {
                CircuitState::Open => warn!(
                    breaker = %self.name,
                    from = ?from,
                    "Circuit breaker opened"
                ),
                _ => debug!(
                    breaker = %self.name,
                    from = ?from,
                    to = ?to,
                    "Circuit breaker state transition"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_millis(50),
                success_threshold,
            },
        )
    }

    #[test]
    fn test_closed_allows_calls() {
        let cb = breaker(3, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 1);
        for _ in 0..3 {
            cb.record_failure(Duration::from_millis(1));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1);
        cb.record_failure(Duration::from_millis(1));
        cb.record_failure(Duration::from_millis(1));
        cb.record_success(Duration::from_millis(1));
        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let cb = breaker(1, 2);
        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 1);
        cb.record_failure(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.should_allow());
        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_force_open_and_closed() {
        let cb = breaker(5, 1);
        cb.force_open();
        assert!(!cb.should_allow());
        cb.force_closed();
        assert!(cb.should_allow());
    }

    #[test]
    fn test_metrics_counts() {
        let cb = breaker(5, 1);
        cb.record_success(Duration::from_millis(2));
        cb.record_failure(Duration::from_millis(2));
        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
    }
}
