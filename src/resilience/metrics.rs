//! Circuit breaker observability
//!
//! Lightweight per-service counters plus a bounded state transition
//! history. Counters are atomics; the transition log sits behind a
//! mutex and is only touched on state changes, which are rare.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Upper bound on retained transition records
const MAX_TRANSITIONS: usize = 100;

/// How many recent transitions a snapshot surfaces
const SNAPSHOT_TRANSITIONS: usize = 10;

/// One circuit breaker state change
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-service breaker counters and transition history
pub struct BreakerMetrics {
    service: String,
    /// Calls admitted past the breaker
    total_calls: AtomicU64,
    successes: AtomicU64,
    /// Failures of a counted kind
    failures: AtomicU64,
    /// Calls rejected while the breaker was open
    rejections: AtomicU64,
    /// Times the breaker tripped open
    trips: AtomicU64,
    transitions: Mutex<Vec<TransitionRecord>>,
    outcomes: Mutex<OutcomeTrace>,
}

/// Streaks and last-seen timestamps, updated on every outcome
#[derive(Debug, Default, Clone)]
struct OutcomeTrace {
    current_failure_streak: u64,
    max_failure_streak: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl BreakerMetrics {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            total_calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            trips: AtomicU64::new(0),
            transitions: Mutex::new(Vec::new()),
            outcomes: Mutex::new(OutcomeTrace::default()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock();
        outcomes.current_failure_streak = 0;
        outcomes.last_success_time = Some(Utc::now());
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock();
        outcomes.current_failure_streak += 1;
        outcomes.max_failure_streak = outcomes
            .max_failure_streak
            .max(outcomes.current_failure_streak);
        outcomes.last_failure_time = Some(Utc::now());
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_trip(&self) {
        self.trips.fetch_add(1, Ordering::SeqCst);
    }

    /// Append a state change, evicting the oldest record past the cap
    pub fn record_transition(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) {
        let mut transitions = self.transitions.lock();
        if transitions.len() >= MAX_TRANSITIONS {
            transitions.remove(0);
        }
        transitions.push(TransitionRecord {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> BreakerMetricsSnapshot {
        let successes = self.successes.load(Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);
        let transitions = self.transitions.lock();
        let recent = transitions
            .iter()
            .rev()
            .take(SNAPSHOT_TRANSITIONS)
            .rev()
            .cloned()
            .collect();
        let outcomes = self.outcomes.lock().clone();

        BreakerMetricsSnapshot {
            service: self.service.clone(),
            total_calls: self.total_calls.load(Ordering::SeqCst),
            successes,
            failures,
            rejections: self.rejections.load(Ordering::SeqCst),
            trips: self.trips.load(Ordering::SeqCst),
            current_failure_streak: outcomes.current_failure_streak,
            max_failure_streak: outcomes.max_failure_streak,
            last_failure_time: outcomes.last_failure_time,
            last_success_time: outcomes.last_success_time,
            recent_transitions: recent,
        }
    }

    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.rejections.store(0, Ordering::SeqCst);
        self.trips.store(0, Ordering::SeqCst);
        self.transitions.lock().clear();
        *self.outcomes.lock() = OutcomeTrace::default();
    }
}

impl std::fmt::Debug for BreakerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("BreakerMetrics")
            .field("service", &self.service)
            .field("total_calls", &snapshot.total_calls)
            .field("failures", &snapshot.failures)
            .field("rejections", &snapshot.rejections)
            .finish()
    }
}

/// Point-in-time view of [`BreakerMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetricsSnapshot {
    pub service: String,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub trips: u64,
    /// Consecutive counted failures since the last success
    pub current_failure_streak: u64,
    /// Longest failure streak seen since the last reset
    pub max_failure_streak: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// Most recent transitions, oldest first
    pub recent_transitions: Vec<TransitionRecord>,
}

impl BreakerMetricsSnapshot {
    /// Success rate as a percentage, 100.0 when no calls were admitted
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 100.0;
        }
        self.successes as f64 / total as f64 * 100.0
    }
}
