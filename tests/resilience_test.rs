//! Resilience Integration Tests
//!
//! Retry and circuit breaker behavior, including the composed
//! breaker-around-retry arrangement used by the API client.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hubcall::error::{ErrorClass, HubError, Result};
use hubcall::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RetryConfig,
    RetryPolicy,
};
use proptest::prelude::*;

fn transient() -> HubError {
    HubError::api_connection("connection reset", "http://svc/data", None, "", None)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false),
    )
}

// ============================================================================
// Circuit Breaker Scenario
// ============================================================================

#[tokio::test]
async fn test_breaker_threshold_scenario() {
    // threshold 3: three counted failures open the circuit, the fourth
    // call is rejected without touching the service
    let breaker = CircuitBreaker::new(
        "analytics",
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_secs(10)),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let _ = breaker
            .execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let rejected = {
        let calls = calls.clone();
        breaker
            .execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    };

    assert_eq!(rejected.unwrap_err().code(), "HUB-006");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_breaker_recovery_probe_cycle() {
    let breaker = CircuitBreaker::new(
        "analytics",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(20)),
    );

    let _ = breaker
        .execute(|| async { Err::<(), _>(transient()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(30)).await;

    // a failing probe reopens the circuit
    let _ = breaker
        .execute(|| async { Err::<(), _>(transient()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(30)).await;

    // a successful probe closes it in one step
    let result = breaker.execute(|| async { Ok("back") }).await;
    assert_eq!(result.unwrap(), "back");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ============================================================================
// Retry Scenario
// ============================================================================

#[test]
fn test_delay_sequence_scenario() {
    // max_retries 2, base 1.0s, exponential 2.0, no jitter:
    // delays between the three attempts are exactly 1.0s then 2.0s
    let config = RetryConfig::default()
        .with_max_retries(2)
        .with_base_delay(Duration::from_secs(1))
        .with_exponential_base(2.0)
        .with_jitter(false);

    assert_eq!(config.delay_for(0), Duration::from_secs(1));
    assert_eq!(config.delay_for(1), Duration::from_secs(2));
}

#[tokio::test]
async fn test_retry_attempt_accounting() {
    let policy = fast_retry(2);
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<()> = {
        let attempts = attempts.clone();
        policy
            .execute("fetch_data", move || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await
    };

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let info = result.unwrap_err();
    let info = info.retry_info().unwrap();
    assert_eq!(info.total_attempts, 3);
    assert_eq!(info.attempts.len(), 3);
}

#[tokio::test]
async fn test_no_credential_auth_never_retried() {
    let policy = fast_retry(3).with_retryable_classes(ErrorClass::ALL);
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<()> = {
        let attempts = attempts.clone();
        policy
            .execute("login", move || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(HubError::authentication(
                        "no API key configured",
                        "api_key",
                        false,
                        false,
                    ))
                }
            })
            .await
    };

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(result.unwrap_err().code(), "HUB-009");
}

// ============================================================================
// Composed: Breaker Wrapping Retry
// ============================================================================

#[tokio::test]
async fn test_failed_retry_sequence_books_one_breaker_failure() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create(
        "analytics",
        CircuitBreakerConfig::default().with_failure_threshold(3),
    );
    let policy = fast_retry(2);
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<()> = {
        let attempts = attempts.clone();
        breaker
            .execute(|| {
                policy.execute("fetch_data", move || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(transient())
                    }
                })
            })
            .await
    };

    assert!(result.is_err());
    // three physical attempts, but one counted breaker failure
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.failure_count(), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_open_breaker_short_circuits_before_retry() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create(
        "analytics",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60)),
    );
    breaker.force_open();

    let policy = fast_retry(3);
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<()> = {
        let attempts = attempts.clone();
        breaker
            .execute(|| {
                policy.execute("fetch_data", move || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(transient())
                    }
                })
            })
            .await
    };

    // no retry-budget slot was consumed
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(result.unwrap_err().code(), "HUB-006");
}

#[tokio::test]
async fn test_recovery_within_retry_sequence_is_breaker_success() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create(
        "analytics",
        CircuitBreakerConfig::default().with_failure_threshold(2),
    );
    let policy = fast_retry(2);
    let attempts = Arc::new(AtomicU32::new(0));

    let result = {
        let attempts = attempts.clone();
        breaker
            .execute(|| {
                policy.execute("fetch_data", move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(transient())
                        } else {
                            Ok("recovered")
                        }
                    }
                })
            })
            .await
    };

    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(breaker.failure_count(), 0);
}

// ============================================================================
// Backoff Delay Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_delays_nondecreasing_without_jitter(
        base_ms in 1u64..1_000,
        exponential_base in 1.0f64..4.0,
        max_ms in 1_000u64..120_000,
        attempt in 0u32..20,
    ) {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_exponential_base(exponential_base)
            .with_max_delay(Duration::from_millis(max_ms))
            .with_jitter(false);

        let current = config.delay_for(attempt);
        let next = config.delay_for(attempt + 1);
        prop_assert!(next >= current);
    }

    #[test]
    fn prop_delays_capped_without_jitter(
        base_ms in 1u64..1_000,
        exponential_base in 1.0f64..4.0,
        max_ms in 1_000u64..120_000,
        attempt in 0u32..30,
    ) {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_exponential_base(exponential_base)
            .with_max_delay(Duration::from_millis(max_ms))
            .with_jitter(false);

        prop_assert!(config.delay_for(attempt) <= Duration::from_millis(max_ms));
    }

    #[test]
    fn prop_jittered_delay_within_band(base_ms in 10u64..1_000) {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_jitter(true);

        let delay = config.delay_for(0).as_secs_f64();
        let base = Duration::from_millis(base_ms).as_secs_f64();
        prop_assert!(delay >= base * 0.9 - 1e-9);
        prop_assert!(delay <= base * 1.1 + 1e-9);
    }
}
