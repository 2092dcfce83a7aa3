//! # Resilience Primitives
//!
//! Circuit breaker protecting the messaging substrate. The breaker trips
//! after repeated failures, causing protected operations to fail fast while
//! the broker recovers; a half-open probe window restores service.

mod circuit_breaker;
mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::CircuitBreakerMetrics;
