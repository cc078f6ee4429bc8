//! Resilience primitives for calls to external hub services
//!
//! Two composable layers:
//!
//! - [`RetryPolicy`]: bounded retry with exponential backoff and jitter
//! - [`CircuitBreaker`]: per-service fail-fast once a failure threshold
//!   is reached, with timed recovery probing
//!
//! [`crate::client::ApiClient`] composes them breaker-outermost, so an
//! open circuit rejects a call before any retry attempt is spent.

pub mod circuit_breaker;
pub mod metrics;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStatus,
    CircuitState,
};
pub use metrics::{BreakerMetrics, BreakerMetricsSnapshot, TransitionRecord};
pub use retry::{RetryConfig, RetryPolicy, RetryStatsSnapshot};
