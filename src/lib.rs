//! Hubcall - resilient call substrate for industrial data-hub plugins
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CLIENT LAYER                           │
//! │  client/      ApiClient (reqwest pool + protection layers)   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PROTECTION LAYER                         │
//! │  resilience/  CircuitBreaker, RetryPolicy, BreakerMetrics    │
//! │  lock/        EquipmentLock (cross-process flock)            │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CROSS-CUTTING                           │
//! │  error/       HubError taxonomy with HUB-xxx codes           │
//! │  config/      HubConfig (TOML + env, service presets)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`client`] | HTTP client composing breaker-around-retry |
//! | [`resilience`] | Circuit breaker, retry with backoff, breaker metrics |
//! | [`lock`] | Per-equipment cross-process locks with holder metadata |
//! | [`error`] | Error taxonomy, severity, remediation suggestions |
//! | [`config`] | TOML config with breaker/retry presets and env overrides |

// ═══════════════════════════════════════════════════════════════
// CLIENT LAYER - Outward-facing HTTP surface
// ═══════════════════════════════════════════════════════════════
pub mod client;

// ═══════════════════════════════════════════════════════════════
// PROTECTION LAYER - Resilience and mutual exclusion
// ═══════════════════════════════════════════════════════════════
pub mod lock;
pub mod resilience;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING - Error handling, configuration
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

/// Install a global tracing subscriber honoring `RUST_LOG`.
///
/// Intended for plugin binaries at startup. Does nothing if a
/// subscriber is already installed, so tests can call it freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

// Error types
pub use error::{
    AttemptRecord, ErrorClass, ErrorKind, ErrorSummary, HubError, Result, RetryInfo, Severity,
};

// Config types
pub use config::HubConfig;

// Resilience types
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStatus,
    CircuitState, RetryConfig, RetryPolicy, RetryStatsSnapshot,
};

// Lock types
pub use lock::{EquipmentLock, EquipmentLockGuard, LockHolder};

// Client types
pub use client::{
    ApiClient, ApiClientConfig, ApiResponse, ClientStatsSnapshot, RequestInfo, RequestOptions,
};
