//! Circuit Breaker Pattern
//!
//! Fails fast when a downstream service keeps failing, instead of
//! hammering it with doomed calls.
//!
//! # States
//!
//! - **Closed**: normal operation, calls go through
//! - **Open**: threshold reached, calls are rejected immediately
//! - **Half-Open**: recovery window elapsed, a probe call is allowed
//!
//! Only errors whose [`ErrorClass`] is in the configured counted set move
//! the failure counter. An uncounted error still propagates to the caller
//! but the breaker treats the call as a success.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubcall::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::with_defaults("analytics");
//! let result = breaker.execute(|| async { call_service().await }).await;
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, HubError, Result};
use crate::resilience::metrics::{BreakerMetrics, BreakerMetricsSnapshot};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through
    Closed,
    /// Service considered down, calls are rejected
    Open,
    /// Recovery window elapsed, probing the service
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures before the circuit opens
    pub failure_threshold: u32,
    /// Time to wait in open state before allowing a probe
    pub recovery_timeout: Duration,
    /// Error classes that move the failure counter
    pub counted_classes: BTreeSet<ErrorClass>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            counted_classes: Self::default_counted_classes(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Every class except breaker rejections themselves. A rejection is
    /// the breaker talking, not the service failing.
    pub fn default_counted_classes() -> BTreeSet<ErrorClass> {
        ErrorClass::ALL
            .iter()
            .copied()
            .filter(|class| *class != ErrorClass::CircuitBreakerOpen)
            .collect()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_counted_classes(
        mut self,
        classes: impl IntoIterator<Item = ErrorClass>,
    ) -> Self {
        self.counted_classes = classes.into_iter().collect();
        self
    }
}

/// Mutable breaker state, guarded by one mutex
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Monotonic clock for the recovery window
    opened_at: Option<Instant>,
    /// Wall clock for reporting
    open_since: Option<DateTime<Utc>>,
}

/// Per-service circuit breaker
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: BreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service = service.into();
        Self {
            metrics: BreakerMetrics::new(service.clone()),
            service,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                open_since: None,
            }),
        }
    }

    pub fn with_defaults(service: impl Into<String>) -> Self {
        Self::new(service, CircuitBreakerConfig::default())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn metrics(&self) -> BreakerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// Rejects immediately with a `CircuitBreakerOpen` error while the
    /// circuit is open and the recovery window has not elapsed. The mutex
    /// is never held across the wrapped call, so concurrent callers that
    /// were admitted before a trip run to completion.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        self.metrics.record_call();

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if self.config.counted_classes.contains(&err.class()) {
                    self.on_failure(err.code());
                } else {
                    // Uncounted errors do not indict the service
                    self.on_success();
                }
                Err(err)
            }
        }
    }

    /// Decide whether a call may proceed, transitioning Open to HalfOpen
    /// when the recovery window has elapsed.
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.recovery_timeout {
                info!(
                    service = %self.service,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "circuit breaker half-open, probing service"
                );
                self.metrics
                    .record_transition("open", "half_open", "recovery window elapsed");
                inner.state = CircuitState::HalfOpen;
            } else {
                self.metrics.record_rejection();
                return Err(HubError::circuit_breaker_open(
                    &self.service,
                    inner.failure_count,
                    inner.open_since.map(|t| t.to_rfc3339()),
                ));
            }
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        self.metrics.record_success();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                // One successful probe is enough to close
                info!(service = %self.service, "circuit breaker closed, service recovered");
                self.metrics
                    .record_transition("half_open", "closed", "probe succeeded");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.open_since = None;
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late; the
                // circuit stays open until a probe succeeds.
            }
        }
    }

    fn on_failure(&self, code: &str) {
        let mut inner = self.inner.lock();
        self.metrics.record_failure();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    service = %self.service,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "counted failure"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        service = %self.service,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                    self.metrics.record_trip();
                    self.metrics.record_transition(
                        "closed",
                        "open",
                        format!("failure threshold reached ({code})"),
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.open_since = Some(Utc::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "probe failed, circuit breaker reopened");
                self.metrics.record_trip();
                self.metrics
                    .record_transition("half_open", "open", format!("probe failed ({code})"));
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.open_since = Some(Utc::now());
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Reset to closed state, clearing all failure history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.metrics
                .record_transition(inner.state.as_str(), "closed", "manual reset");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.open_since = None;
    }

    /// Force the circuit open, e.g. ahead of planned downstream maintenance
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            self.metrics
                .record_transition(inner.state.as_str(), "open", "forced open");
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.open_since = Some(Utc::now());
    }

    #[cfg(test)]
    fn force_half_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::HalfOpen;
    }

    /// Reporting view merging configuration, live state and metrics
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs_f64(),
            open_since: inner.open_since.map(|t| t.to_rfc3339()),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

/// Serializable breaker status for health endpoints and reports
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub open_since: Option<String>,
    pub metrics: BreakerMetricsSnapshot,
}

/// Explicit collection of named circuit breakers.
///
/// Components that need a breaker receive a registry handle; there is no
/// process-global instance. Two components asking for the same service
/// name share one breaker.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `service`, creating it with `config` on first
    /// use. A later call with a different config returns the existing
    /// breaker unchanged.
    pub fn get_or_create(
        &self,
        service: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|entry| entry.value().clone())
    }

    /// Drop the breaker for `service`, returning it if it was registered.
    /// Clients still holding the `Arc` keep using it, but the next
    /// `get_or_create` starts fresh.
    pub fn remove(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(service).map(|(_, breaker)| breaker)
    }

    /// Registered service names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.reset();
        }
    }

    /// Status of every registered breaker, keyed by service name
    pub fn status_all(&self) -> std::collections::BTreeMap<String, CircuitBreakerStatus> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.status()))
            .collect()
    }

    /// Metrics of every registered breaker, keyed by service name.
    /// Cheaper than [`Self::status_all`] when only counters are wanted.
    pub fn all_metrics(&self) -> std::collections::BTreeMap<String, BreakerMetricsSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.metrics()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
