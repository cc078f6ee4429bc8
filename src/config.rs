//! Hub plugin configuration
//!
//! Settings load from `~/.config/hubcall/config.toml` (or the path in
//! `HUBCALL_CONFIG`). A missing file means defaults; a malformed file is
//! a `Configuration` error, not a silent fallback.
//!
//! ## Priority order (highest to lowest)
//!
//! 1. Environment variables (`HUBCALL_STATE_DIR`, `HUBCALL_CONFIG`)
//! 2. Config file
//! 3. Built-in defaults, including the per-service breaker presets and
//!    per-operation retry presets

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ApiClientConfig;
use crate::error::{HubError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Environment variable naming an alternate config file
pub const ENV_CONFIG: &str = "HUBCALL_CONFIG";

/// Environment variable overriding the lock state directory
pub const ENV_STATE_DIR: &str = "HUBCALL_STATE_DIR";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub lock: LockSection,
}

/// `[client]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Base URL of the hub API, e.g. `http://analytics.local:3000`
    pub base_url: Option<String>,

    /// Long-lived API key exchanged for a session key at login
    pub api_key: Option<String>,

    pub timeout_secs: u64,
    pub max_retries: u32,
    pub pool_connections: usize,
    pub pool_maxsize: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            pool_connections: 10,
            pool_maxsize: 10,
        }
    }
}

/// `[retry]` table: named per-operation backoff presets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "RetrySection::default_presets")]
    pub presets: BTreeMap<String, RetryPreset>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            presets: Self::default_presets(),
        }
    }
}

impl RetrySection {
    fn default_presets() -> BTreeMap<String, RetryPreset> {
        BTreeMap::from([
            (
                "api_call".to_string(),
                RetryPreset {
                    max_retries: 3,
                    base_delay_secs: 1.0,
                    max_delay_secs: 30.0,
                    exponential_base: 2.0,
                    jitter: true,
                },
            ),
            (
                "data_fetch".to_string(),
                RetryPreset {
                    max_retries: 5,
                    base_delay_secs: 2.0,
                    max_delay_secs: 60.0,
                    exponential_base: 2.0,
                    jitter: true,
                },
            ),
            (
                "authentication".to_string(),
                RetryPreset {
                    max_retries: 2,
                    base_delay_secs: 1.0,
                    max_delay_secs: 10.0,
                    exponential_base: 2.0,
                    jitter: false,
                },
            ),
            (
                "file_operation".to_string(),
                RetryPreset {
                    max_retries: 3,
                    base_delay_secs: 0.5,
                    max_delay_secs: 5.0,
                    exponential_base: 2.0,
                    jitter: false,
                },
            ),
        ])
    }
}

/// One named backoff preset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPreset {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl RetryPreset {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_secs_f64(self.base_delay_secs))
            .with_max_delay(Duration::from_secs_f64(self.max_delay_secs))
            .with_exponential_base(self.exponential_base)
            .with_jitter(self.jitter)
    }
}

/// `[breaker]` table: per-service threshold and recovery presets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSection {
    #[serde(default = "BreakerSection::default_services")]
    pub services: BTreeMap<String, BreakerPreset>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            services: Self::default_services(),
        }
    }
}

impl BreakerSection {
    fn default_services() -> BTreeMap<String, BreakerPreset> {
        BTreeMap::from([
            (
                "analytics".to_string(),
                BreakerPreset {
                    failure_threshold: 3,
                    recovery_timeout_secs: 30,
                },
            ),
            (
                "historian".to_string(),
                BreakerPreset {
                    failure_threshold: 5,
                    recovery_timeout_secs: 60,
                },
            ),
            (
                "authentication".to_string(),
                BreakerPreset {
                    failure_threshold: 2,
                    recovery_timeout_secs: 120,
                },
            ),
            (
                "data_fetch".to_string(),
                BreakerPreset {
                    failure_threshold: 5,
                    recovery_timeout_secs: 45,
                },
            ),
        ])
    }
}

/// One named breaker preset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerPreset {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl BreakerPreset {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_recovery_timeout(Duration::from_secs(self.recovery_timeout_secs))
    }
}

/// `[lock]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockSection {
    /// Directory holding per-equipment lock files
    pub state_dir: Option<PathBuf>,

    pub poll_interval_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            poll_interval_secs: 1,
            default_timeout_secs: 30,
        }
    }
}

impl HubConfig {
    /// `~/.config/hubcall/` on Unix, `%APPDATA%/hubcall/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hubcall")
    }

    /// Config file path, honoring the `HUBCALL_CONFIG` override
    pub fn config_path() -> PathBuf {
        match std::env::var(ENV_CONFIG) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::config_dir().join("config.toml"),
        }
    }

    /// Load from the default path; a missing file yields defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path; a missing file yields defaults
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            HubError::configuration(
                format!("failed to read config file: {e}"),
                path.display().to_string(),
                "",
            )
        })?;

        toml::from_str(&content).map_err(|e| {
            HubError::configuration(
                format!("failed to parse config file: {e}"),
                path.display().to_string(),
                "",
            )
        })
    }

    /// Save to the default path, creating the config directory if needed
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        let path = Self::config_path();

        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                HubError::configuration(
                    format!("failed to create config directory: {e}"),
                    dir.display().to_string(),
                    "",
                )
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            HubError::configuration(format!("failed to serialize config: {e}"), "", "")
        })?;

        fs::write(&path, content).map_err(|e| {
            HubError::configuration(
                format!("failed to write config file: {e}"),
                path.display().to_string(),
                "",
            )
        })
    }

    /// Apply environment overrides on top of file values
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            if !dir.is_empty() {
                self.lock.state_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    /// Effective lock state directory
    pub fn state_dir(&self) -> PathBuf {
        self.lock.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hubcall")
                .join("locks")
        })
    }

    /// Breaker settings for `service`, falling back to defaults for
    /// unknown services
    pub fn breaker_config(&self, service: &str) -> CircuitBreakerConfig {
        self.breaker
            .services
            .get(service)
            .map(BreakerPreset::to_breaker_config)
            .unwrap_or_default()
    }

    /// Backoff settings for a named preset, falling back to defaults for
    /// unknown names
    pub fn retry_config(&self, preset: &str) -> RetryConfig {
        self.retry
            .presets
            .get(preset)
            .map(RetryPreset::to_retry_config)
            .unwrap_or_default()
    }

    /// Client construction parameters; fails when no base URL is set
    pub fn client_config(&self) -> Result<ApiClientConfig> {
        let base_url = self.client.base_url.as_deref().ok_or_else(|| {
            HubError::configuration(
                "client.base_url is not set",
                Self::config_path().display().to_string(),
                "client.base_url",
            )
        })?;

        Ok(ApiClientConfig::new(base_url)
            .with_timeout(Duration::from_secs(self.client.timeout_secs))
            .with_max_retries(self.client.max_retries)
            .with_pool(self.client.pool_connections, self.client.pool_maxsize))
    }
}
