//! Bounded retry with exponential backoff and jitter
//!
//! A [`RetryPolicy`] admits only errors whose class is in its retryable
//! set. Breaker rejections are never retried: retrying against an open
//! circuit only burns the recovery window. When retries are exhausted the
//! terminal error is returned enriched with a [`RetryInfo`] record of
//! every attempt.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubcall::resilience::{RetryConfig, RetryPolicy};
//!
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let result = policy.execute("fetch_data", || async { fetch_data().await }).await;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AttemptRecord, ErrorClass, ErrorKind, HubError, Result, RetryInfo};

/// Backoff parameters. Immutable once built; tuning produces a new value
/// via [`RetryStatsSnapshot::suggest_tuning`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Apply ±10% random jitter to each delay
    pub jitter: bool,
    /// Uniform scale on top of the exponential curve
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    const JITTER_FACTOR: f64 = 0.1;

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay after the n-th failed attempt (0-based).
    ///
    /// The exponential value is capped at `max_delay` first, then jitter
    /// is applied, so jitter may nudge the result slightly above the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64()
            * self.exponential_base.powi(attempt as i32)
            * self.backoff_multiplier;
        let mut delay = raw.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let factor =
                rand::thread_rng().gen_range(1.0 - Self::JITTER_FACTOR..=1.0 + Self::JITTER_FACTOR);
            delay *= factor;
        }

        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Retry loop over a fallible async operation
pub struct RetryPolicy {
    config: RetryConfig,
    retryable: BTreeSet<ErrorClass>,
    stats: Mutex<RetryStats>,
}

impl RetryPolicy {
    /// Transient classes worth a second try
    pub fn default_retryable_classes() -> BTreeSet<ErrorClass> {
        [ErrorClass::ApiConnection, ErrorClass::DataFetch]
            .into_iter()
            .collect()
    }

    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retryable: Self::default_retryable_classes(),
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Replace the retryable set. Breaker rejections are stripped out
    /// unconditionally.
    pub fn with_retryable_classes(
        mut self,
        classes: impl IntoIterator<Item = ErrorClass>,
    ) -> Self {
        self.retryable = classes
            .into_iter()
            .filter(|class| *class != ErrorClass::CircuitBreakerOpen)
            .collect();
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run one named unit of work, retrying admitted failures up to
    /// `max_retries` times with backoff between attempts.
    ///
    /// The operation name only labels logs and statistics.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut total_delay_secs = 0.0;
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "operation recovered after retry"
                        );
                    }
                    self.record_outcome(operation_name, true, attempt + 1, total_delay_secs, None);
                    return Ok(value);
                }
                Err(err) => {
                    let admitted = self.is_retryable(&err);

                    if !admitted || attempt >= self.config.max_retries {
                        attempts.push(AttemptRecord {
                            attempt: attempt + 1,
                            delay_secs: 0.0,
                            error: Some(err.to_string()),
                            timestamp: Utc::now(),
                        });
                        if admitted {
                            warn!(
                                operation = operation_name,
                                attempts = attempt + 1,
                                code = err.code(),
                                "retries exhausted"
                            );
                        }
                        self.record_outcome(
                            operation_name,
                            false,
                            attempt + 1,
                            total_delay_secs,
                            Some(err.class().name()),
                        );
                        return Err(err.with_retry_info(RetryInfo {
                            total_attempts: attempt + 1,
                            max_retries: self.config.max_retries,
                            total_delay_secs,
                            attempts,
                        }));
                    }

                    let delay = self.config.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_retries + 1,
                        delay_secs = delay.as_secs_f64(),
                        code = err.code(),
                        "attempt failed, backing off"
                    );
                    attempts.push(AttemptRecord {
                        attempt: attempt + 1,
                        delay_secs: delay.as_secs_f64(),
                        error: Some(err.to_string()),
                        timestamp: Utc::now(),
                    });
                    total_delay_secs += delay.as_secs_f64();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Whether a failure may be retried.
    ///
    /// Authentication errors are admitted only when a credential was
    /// actually supplied; without one, every attempt will be rejected the
    /// same way.
    fn is_retryable(&self, err: &HubError) -> bool {
        match err.kind() {
            ErrorKind::CircuitBreakerOpen { .. } => false,
            ErrorKind::Authentication {
                credential_supplied,
                ..
            } => self.retryable.contains(&ErrorClass::Authentication) && *credential_supplied,
            kind => self.retryable.contains(&kind.class()),
        }
    }

    fn record_outcome(
        &self,
        operation_name: &str,
        success: bool,
        attempts: u32,
        delay_secs: f64,
        terminal_error: Option<&str>,
    ) {
        let mut stats = self.stats.lock();
        stats.total_operations += 1;
        if success {
            stats.successful_operations += 1;
        } else {
            stats.failed_operations += 1;
        }
        stats.total_attempts += u64::from(attempts);
        stats.total_retries += u64::from(attempts.saturating_sub(1));
        stats.total_delay_secs += delay_secs;
        if let Some(error_type) = terminal_error {
            *stats.error_counts.entry(error_type.to_string()).or_insert(0) += 1;
        }
        *stats
            .operation_counts
            .entry(operation_name.to_string())
            .or_insert(0) += 1;
        stats.last_updated = Some(Utc::now());
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        let stats = self.stats.lock();
        RetryStatsSnapshot {
            total_operations: stats.total_operations,
            successful_operations: stats.successful_operations,
            failed_operations: stats.failed_operations,
            total_attempts: stats.total_attempts,
            total_retries: stats.total_retries,
            total_delay_secs: stats.total_delay_secs,
            error_counts: stats.error_counts.clone(),
            operation_counts: stats.operation_counts.clone(),
            last_updated: stats.last_updated,
        }
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = RetryStats::default();
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("retryable", &self.retryable)
            .finish()
    }
}

#[derive(Debug, Default)]
struct RetryStats {
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    total_attempts: u64,
    total_retries: u64,
    total_delay_secs: f64,
    error_counts: BTreeMap<String, u64>,
    operation_counts: BTreeMap<String, u64>,
    last_updated: Option<DateTime<Utc>>,
}

/// Serializable view of accumulated retry outcomes
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_attempts: u64,
    /// Attempts beyond the first, summed over all operations
    pub total_retries: u64,
    pub total_delay_secs: f64,
    /// Terminal failures keyed by error type name
    pub error_counts: BTreeMap<String, u64>,
    /// Operations keyed by the name passed to `execute`
    pub operation_counts: BTreeMap<String, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RetryStatsSnapshot {
    /// Minimum operations before tuning suggestions are meaningful
    const MIN_SAMPLE: u64 = 10;

    /// Success rate in [0.0, 1.0], 1.0 when nothing has run yet
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 1.0;
        }
        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Mean attempts per operation
    pub fn avg_attempts(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.total_attempts as f64 / self.total_operations as f64
    }

    /// Derive an adjusted config from observed outcomes.
    ///
    /// Below 70% success the retry budget grows by one (capped at 10);
    /// above 2.5 mean attempts the base delay stretches by 10% (capped at
    /// 10s). Returns None when the sample is too small or nothing would
    /// change.
    pub fn suggest_tuning(&self, current: &RetryConfig) -> Option<RetryConfig> {
        if self.total_operations < Self::MIN_SAMPLE {
            return None;
        }

        let mut tuned = current.clone();

        if self.success_rate() < 0.7 && tuned.max_retries < 10 {
            tuned.max_retries += 1;
        }
        if self.avg_attempts() > 2.5 {
            let stretched = tuned.base_delay.as_secs_f64() * 1.1;
            tuned.base_delay = Duration::from_secs_f64(stretched.min(10.0));
        }

        (tuned != *current).then_some(tuned)
    }
}
