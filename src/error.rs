//! Plugin runtime error taxonomy with machine codes
//!
//! Error code ranges:
//! - HUB-001: Configuration errors
//! - HUB-002: API connection errors
//! - HUB-003: Data fetch errors
//! - HUB-004: Validation errors
//! - HUB-005: Equipment lock errors
//! - HUB-006: Circuit breaker rejections
//! - HUB-007: Processing mode errors
//! - HUB-008: Temporary file errors
//! - HUB-009: Authentication errors
//!
//! Every failure carries exactly one kind and a non-empty code. Errors are
//! inert values: constructed at the failure site, optionally enriched with
//! retry metadata as they propagate, and terminally consumed by a response
//! serializer via [`HubError::to_json`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

/// Lightweight tag naming an error kind without its payload.
///
/// Used for explicit membership sets (retryable kinds, circuit-breaker
/// counted kinds) so that routing decisions never rely on runtime type
/// inspection or message sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    ApiConnection,
    DataFetch,
    Validation,
    Lock,
    CircuitBreakerOpen,
    ProcessingMode,
    TempFile,
    Authentication,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 9] = [
        ErrorClass::Configuration,
        ErrorClass::ApiConnection,
        ErrorClass::DataFetch,
        ErrorClass::Validation,
        ErrorClass::Lock,
        ErrorClass::CircuitBreakerOpen,
        ErrorClass::ProcessingMode,
        ErrorClass::TempFile,
        ErrorClass::Authentication,
    ];

    /// Stable name used in serialized reports and histograms
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "ConfigurationError",
            ErrorClass::ApiConnection => "ApiConnectionError",
            ErrorClass::DataFetch => "DataFetchError",
            ErrorClass::Validation => "ValidationError",
            ErrorClass::Lock => "LockError",
            ErrorClass::CircuitBreakerOpen => "CircuitBreakerOpenError",
            ErrorClass::ProcessingMode => "ProcessingModeError",
            ErrorClass::TempFile => "TempFileError",
            ErrorClass::Authentication => "AuthenticationError",
        }
    }
}

/// Fixed default severity per error kind.
///
/// Lock timeouts are LOW because they self-resolve; configuration, mode
/// and authentication errors are HIGH because they need operator
/// intervention, not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

/// The failure kinds raised by the plugin runtime, with kind-specific
/// diagnostic context.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum ErrorKind {
    #[error("[HUB-001] Configuration error: {message}")]
    #[diagnostic(
        code(hubcall::configuration),
        help("Check the config file syntax, required fields and value formats")
    )]
    Configuration {
        message: String,
        config_path: String,
        invalid_field: String,
    },

    #[error("[HUB-002] API connection error: {message}")]
    #[diagnostic(
        code(hubcall::api_connection),
        help("Check the API server is up, the network path and the timeout setting")
    )]
    ApiConnection {
        message: String,
        url: String,
        status: Option<u16>,
        body: String,
        timeout_secs: Option<f64>,
    },

    #[error("[HUB-003] Data fetch error: {message}")]
    #[diagnostic(
        code(hubcall::data_fetch),
        help("Check equipment and tag names, and that the time range holds data")
    )]
    DataFetch {
        message: String,
        equipment: String,
        tags: Vec<String>,
        start: String,
        end: String,
    },

    #[error("[HUB-004] Validation error: {message}")]
    #[diagnostic(
        code(hubcall::validation),
        help("Check the response structure against the expected fields")
    )]
    Validation {
        message: String,
        validation_type: String,
        expected_fields: Vec<String>,
    },

    #[error("[HUB-005] Lock error: {message}")]
    #[diagnostic(
        code(hubcall::lock),
        help("Another process may be analyzing this equipment; wait or raise the timeout")
    )]
    Lock {
        message: String,
        equipment: String,
        timeout_secs: u64,
    },

    #[error("[HUB-006] Circuit breaker '{service}' is open")]
    #[diagnostic(
        code(hubcall::circuit_breaker_open),
        help("Wait for the downstream service to recover, or reset the breaker manually")
    )]
    CircuitBreakerOpen {
        service: String,
        failure_count: u32,
        open_since: Option<String>,
    },

    #[error("[HUB-007] Processing mode error: {message}")]
    #[diagnostic(
        code(hubcall::processing_mode),
        help("Check the requested mode against the supported mode list")
    )]
    ProcessingMode {
        message: String,
        specified: String,
        supported: Vec<String>,
    },

    #[error("[HUB-008] Temp file error: {message}")]
    #[diagnostic(
        code(hubcall::temp_file),
        help("Check disk space and write permissions on the temp directory")
    )]
    TempFile {
        message: String,
        path: String,
        operation: String,
    },

    #[error("[HUB-009] Authentication error: {message}")]
    #[diagnostic(
        code(hubcall::authentication),
        help("Check the API key configuration and session key expiry")
    )]
    Authentication {
        message: String,
        auth_type: String,
        credential_supplied: bool,
        session_expired: bool,
    },
}

impl ErrorKind {
    /// Machine error code, e.g. "HUB-002"
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Configuration { .. } => "HUB-001",
            ErrorKind::ApiConnection { .. } => "HUB-002",
            ErrorKind::DataFetch { .. } => "HUB-003",
            ErrorKind::Validation { .. } => "HUB-004",
            ErrorKind::Lock { .. } => "HUB-005",
            ErrorKind::CircuitBreakerOpen { .. } => "HUB-006",
            ErrorKind::ProcessingMode { .. } => "HUB-007",
            ErrorKind::TempFile { .. } => "HUB-008",
            ErrorKind::Authentication { .. } => "HUB-009",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Configuration { .. } => ErrorClass::Configuration,
            ErrorKind::ApiConnection { .. } => ErrorClass::ApiConnection,
            ErrorKind::DataFetch { .. } => ErrorClass::DataFetch,
            ErrorKind::Validation { .. } => ErrorClass::Validation,
            ErrorKind::Lock { .. } => ErrorClass::Lock,
            ErrorKind::CircuitBreakerOpen { .. } => ErrorClass::CircuitBreakerOpen,
            ErrorKind::ProcessingMode { .. } => ErrorClass::ProcessingMode,
            ErrorKind::TempFile { .. } => ErrorClass::TempFile,
            ErrorKind::Authentication { .. } => ErrorClass::Authentication,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.class() {
            ErrorClass::Configuration => Severity::High,
            ErrorClass::ApiConnection => Severity::Medium,
            ErrorClass::DataFetch => Severity::Medium,
            ErrorClass::Validation => Severity::Medium,
            ErrorClass::Lock => Severity::Low,
            ErrorClass::CircuitBreakerOpen => Severity::Medium,
            ErrorClass::ProcessingMode => Severity::High,
            ErrorClass::TempFile => Severity::Medium,
            ErrorClass::Authentication => Severity::High,
        }
    }

    /// Fixed remediation suggestions per kind
    pub fn suggestions(&self) -> &'static [&'static str] {
        match self {
            ErrorKind::Configuration { .. } => &[
                "Check the config file syntax",
                "Check that required fields are set",
                "Check value formats against the documented schema",
            ],
            ErrorKind::ApiConnection { .. } => &[
                "Check the API server is running",
                "Check network connectivity",
                "Check credentials (API key, session key)",
                "Adjust the timeout setting",
            ],
            ErrorKind::DataFetch { .. } => &[
                "Check equipment and tag names",
                "Check that the time range holds data",
                "Check the data API is healthy",
            ],
            ErrorKind::Validation { .. } => &[
                "Check the API response format",
                "Check that required fields are present",
                "Check data types match the expected shape",
            ],
            ErrorKind::Lock { .. } => &[
                "Check whether another process is running against this equipment",
                "Remove a stale lock file if the holder is gone",
                "Adjust the lock timeout",
            ],
            ErrorKind::CircuitBreakerOpen { .. } => &[
                "Wait for the downstream service to recover",
                "Reset the circuit breaker manually",
                "Investigate the root cause of the failures",
            ],
            ErrorKind::ProcessingMode { .. } => &[
                "Check the supported processing modes",
                "Check the mode environment variable",
                "Check the mode argument",
            ],
            ErrorKind::TempFile { .. } => &[
                "Check disk space",
                "Check write permissions on the temp directory",
                "Delete old temporary files",
            ],
            ErrorKind::Authentication { .. } => &[
                "Check the API key is configured",
                "Check the session key expiry",
                "Check the authentication API response",
            ],
        }
    }

    /// Kind-specific context as a JSON map
    pub fn details(&self) -> Value {
        match self {
            ErrorKind::Configuration {
                config_path,
                invalid_field,
                ..
            } => json!({
                "config_path": config_path,
                "invalid_field": invalid_field,
            }),
            ErrorKind::ApiConnection {
                url,
                status,
                body,
                timeout_secs,
                ..
            } => json!({
                "url": url,
                "status_code": status,
                "response_text": body,
                "timeout": timeout_secs,
            }),
            ErrorKind::DataFetch {
                equipment,
                tags,
                start,
                end,
                ..
            } => json!({
                "equipment_name": equipment,
                "tag_names": tags,
                "time_range": { "start": start, "end": end },
            }),
            ErrorKind::Validation {
                validation_type,
                expected_fields,
                ..
            } => json!({
                "validation_type": validation_type,
                "expected_fields": expected_fields,
            }),
            ErrorKind::Lock {
                equipment,
                timeout_secs,
                ..
            } => json!({
                "equipment_name": equipment,
                "lock_timeout": timeout_secs,
            }),
            ErrorKind::CircuitBreakerOpen {
                service,
                failure_count,
                open_since,
            } => json!({
                "service_name": service,
                "failure_count": failure_count,
                "open_time": open_since,
            }),
            ErrorKind::ProcessingMode {
                specified,
                supported,
                ..
            } => json!({
                "specified_mode": specified,
                "supported_modes": supported,
            }),
            ErrorKind::TempFile {
                path, operation, ..
            } => json!({
                "file_path": path,
                "operation": operation,
            }),
            ErrorKind::Authentication {
                auth_type,
                credential_supplied,
                session_expired,
                ..
            } => json!({
                "auth_type": auth_type,
                "credential_supplied": credential_supplied,
                "session_expired": session_expired,
            }),
        }
    }
}

/// Metadata attached to a terminally failed error by the retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    pub total_attempts: u32,
    pub max_retries: u32,
    pub total_delay_secs: f64,
    pub attempts: Vec<AttemptRecord>,
}

/// One entry of the per-attempt log inside [`RetryInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt index
    pub attempt: u32,
    /// Delay slept after this attempt
    pub delay_secs: f64,
    /// Stringified error, None for the successful attempt
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A plugin runtime failure: one [`ErrorKind`] plus propagation metadata.
#[derive(Debug, Clone)]
pub struct HubError {
    kind: ErrorKind,
    retry_info: Option<RetryInfo>,
    timestamp: DateTime<Utc>,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for HubError {}

impl Diagnostic for HubError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Diagnostic::code(&self.kind)
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Diagnostic::help(&self.kind)
    }
}

impl From<ErrorKind> for HubError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            retry_info: None,
            timestamp: Utc::now(),
        }
    }
}

impl HubError {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn suggestions(&self) -> &'static [&'static str] {
        self.kind.suggestions()
    }

    pub fn details(&self) -> Value {
        self.kind.details()
    }

    pub fn retry_info(&self) -> Option<&RetryInfo> {
        self.retry_info.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Attach retry metadata as the error propagates out of a retry loop
    pub fn with_retry_info(mut self, info: RetryInfo) -> Self {
        self.retry_info = Some(info);
        self
    }

    /// Serialized form for external reporting channels
    pub fn to_json(&self) -> Value {
        json!({
            "error_type": self.class().name(),
            "error_code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
            "suggestions": self.suggestions(),
            "retry_info": self.retry_info,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }

    // ── Constructors for the common failure sites ──────────────────

    pub fn configuration(
        message: impl Into<String>,
        config_path: impl Into<String>,
        invalid_field: impl Into<String>,
    ) -> Self {
        ErrorKind::Configuration {
            message: message.into(),
            config_path: config_path.into(),
            invalid_field: invalid_field.into(),
        }
        .into()
    }

    pub fn api_connection(
        message: impl Into<String>,
        url: impl Into<String>,
        status: Option<u16>,
        body: impl Into<String>,
        timeout_secs: Option<f64>,
    ) -> Self {
        ErrorKind::ApiConnection {
            message: message.into(),
            url: url.into(),
            status,
            body: body.into(),
            timeout_secs,
        }
        .into()
    }

    pub fn data_fetch(
        message: impl Into<String>,
        equipment: impl Into<String>,
        tags: Vec<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        ErrorKind::DataFetch {
            message: message.into(),
            equipment: equipment.into(),
            tags,
            start: start.into(),
            end: end.into(),
        }
        .into()
    }

    pub fn validation(
        message: impl Into<String>,
        validation_type: impl Into<String>,
        expected_fields: Vec<String>,
    ) -> Self {
        ErrorKind::Validation {
            message: message.into(),
            validation_type: validation_type.into(),
            expected_fields,
        }
        .into()
    }

    pub fn lock(equipment: impl Into<String>, timeout_secs: u64) -> Self {
        let equipment = equipment.into();
        ErrorKind::Lock {
            message: format!(
                "could not acquire lock for '{equipment}' within {timeout_secs}s"
            ),
            equipment,
            timeout_secs,
        }
        .into()
    }

    pub fn circuit_breaker_open(
        service: impl Into<String>,
        failure_count: u32,
        open_since: Option<String>,
    ) -> Self {
        ErrorKind::CircuitBreakerOpen {
            service: service.into(),
            failure_count,
            open_since,
        }
        .into()
    }

    pub fn processing_mode(
        message: impl Into<String>,
        specified: impl Into<String>,
        supported: Vec<String>,
    ) -> Self {
        ErrorKind::ProcessingMode {
            message: message.into(),
            specified: specified.into(),
            supported,
        }
        .into()
    }

    pub fn temp_file(
        message: impl Into<String>,
        path: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        ErrorKind::TempFile {
            message: message.into(),
            path: path.into(),
            operation: operation.into(),
        }
        .into()
    }

    pub fn authentication(
        message: impl Into<String>,
        auth_type: impl Into<String>,
        credential_supplied: bool,
        session_expired: bool,
    ) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
            auth_type: auth_type.into(),
            credential_supplied,
            session_expired,
        }
        .into()
    }
}

/// Aggregate view over a batch of errors, for multi-equipment reporting
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    /// Counts keyed by error type name
    pub error_types: BTreeMap<String, usize>,
    /// Counts keyed by severity ("HIGH" / "MEDIUM" / "LOW")
    pub severity_distribution: BTreeMap<String, usize>,
    /// Union of all remediation suggestions, deduplicated
    pub common_suggestions: Vec<String>,
}

impl ErrorSummary {
    pub fn from_errors(errors: &[HubError]) -> Self {
        let mut error_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut severity_distribution: BTreeMap<String, usize> = BTreeMap::new();
        for sev in ["HIGH", "MEDIUM", "LOW"] {
            severity_distribution.insert(sev.to_string(), 0);
        }
        let mut suggestions: BTreeSet<&'static str> = BTreeSet::new();

        for error in errors {
            *error_types
                .entry(error.class().name().to_string())
                .or_insert(0) += 1;
            *severity_distribution
                .entry(error.severity().as_str().to_string())
                .or_insert(0) += 1;
            suggestions.extend(error.suggestions());
        }

        Self {
            total_errors: errors.len(),
            error_types,
            severity_distribution,
            common_suggestions: suggestions.into_iter().map(String::from).collect(),
        }
    }
}
