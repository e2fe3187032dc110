//! Configuration structures for the governance layer
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs to name the values it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::errors::{BridgeError, Result};
use crate::impl_label_conversions;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub quota: QuotaConfig,
    pub governor: GovernorConfig,
    pub retry: RetrySettings,
    pub polling: PollingConfig,
    pub token: TokenConfig,
    pub reauth: ReauthConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl GovernanceConfig {
    /// Validate every section.
    ///
    /// # Errors
    /// Returns `BridgeError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.quota.validate()?;
        self.governor.validate()?;
        self.retry.validate()?;
        self.polling.validate()?;
        self.token.validate()?;
        self.reauth.validate()?;
        Ok(())
    }
}

/// Daily call budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub base_quota: u64,
    pub per_device_quota: u64,
    /// Safety margin applied to the provider's ceiling (0, 1].
    pub buffer_fraction: f64,
    pub summary_interval_secs: u64,
    pub priority_methods: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            base_quota: DEFAULT_BASE_QUOTA,
            per_device_quota: DEFAULT_PER_DEVICE_QUOTA,
            buffer_fraction: DEFAULT_QUOTA_BUFFER,
            summary_interval_secs: DEFAULT_QUOTA_SUMMARY_SECS,
            priority_methods: DEFAULT_PRIORITY_METHODS.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl QuotaConfig {
    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.buffer_fraction > 0.0 && self.buffer_fraction <= 1.0) {
            return Err(BridgeError::Config(format!(
                "quota.buffer_fraction must be in (0, 1], got {}",
                self.buffer_fraction
            )));
        }
        Ok(())
    }
}

/// Rate limiter and debouncer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub min_spacing_ms: u64,
    pub debounce_window_ms: u64,
    pub bypass_methods: Vec<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: DEFAULT_MIN_SPACING_MS,
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            bypass_methods: DEFAULT_BYPASS_METHODS.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl GovernorConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.debounce_window_ms == 0 {
            return Err(BridgeError::Config(
                "governor.debounce_window_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-operation retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BridgeError::Config("retry.max_attempts must be greater than 0".into()));
        }
        if self.backoff_factor < 1.0 {
            return Err(BridgeError::Config(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// Adaptive polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub base_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub inactive_multiplier: f64,
    pub error_penalty: f64,
    pub dynamic_polling: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: DEFAULT_POLL_BASE_SECS,
            min_interval_secs: DEFAULT_POLL_MIN_SECS,
            max_interval_secs: DEFAULT_POLL_MAX_SECS,
            inactive_multiplier: DEFAULT_POLL_INACTIVE_MULTIPLIER,
            error_penalty: DEFAULT_POLL_ERROR_PENALTY,
            dynamic_polling: true,
        }
    }
}

impl PollingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    /// # Errors
    /// `BridgeError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_secs == 0 {
            return Err(BridgeError::Config("polling.min_interval_secs must be > 0".into()));
        }
        if self.min_interval_secs > self.max_interval_secs {
            return Err(BridgeError::Config(format!(
                "polling.min_interval_secs ({}) exceeds max_interval_secs ({})",
                self.min_interval_secs, self.max_interval_secs
            )));
        }
        // Written as negations so NaN is rejected too.
        let multipliers = [self.inactive_multiplier, self.error_penalty];
        if multipliers.iter().any(|m| !(m.is_finite() && *m >= 1.0)) {
            return Err(BridgeError::Config(format!(
                "polling multipliers must be finite and >= 1.0 (inactive_multiplier {}, error_penalty {})",
                self.inactive_multiplier, self.error_penalty
            )));
        }
        Ok(())
    }
}

/// Credential lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub proactive_refresh: bool,
    pub refresh_floor_secs: u64,
    pub max_timer_hop_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            proactive_refresh: true,
            refresh_floor_secs: DEFAULT_REFRESH_FLOOR_SECS,
            max_timer_hop_ms: MAX_TIMER_HOP_MS,
        }
    }
}

impl TokenConfig {
    pub fn refresh_floor(&self) -> Duration {
        Duration::from_secs(self.refresh_floor_secs)
    }

    pub fn max_timer_hop(&self) -> Duration {
        Duration::from_millis(self.max_timer_hop_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_timer_hop_ms == 0 {
            return Err(BridgeError::Config("token.max_timer_hop_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Forced re-login settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReauthConfig {
    pub account: String,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Consecutive failures after which failures are logged as errors.
    pub escalate_after: u32,
    /// `None` keeps retrying indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReauthConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            initial_delay_secs: DEFAULT_REAUTH_INITIAL_DELAY_SECS,
            max_delay_secs: DEFAULT_REAUTH_MAX_DELAY_SECS,
            escalate_after: DEFAULT_REAUTH_ESCALATE_AFTER,
            max_attempts: None,
        }
    }
}

impl ReauthConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(BridgeError::Config("reauth.max_attempts must be > 0 when set".into()));
        }
        Ok(())
    }
}

/// Session persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { path: PathBuf::from(DEFAULT_SESSION_FILE) }
    }
}

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl_label_conversions!(LogFormat {
    Pretty => "pretty",
    Json => "json",
});

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Fallback filter when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: LogFormat::Pretty, filter: "info".to_string() }
    }
}
