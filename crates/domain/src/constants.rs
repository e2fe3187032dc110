//! Domain constants
//!
//! Centralized defaults for the governance layer. Configuration structs fall
//! back to these when a field is not provided.

// Daily call quota
pub const DEFAULT_BASE_QUOTA: u64 = 3200;
pub const DEFAULT_PER_DEVICE_QUOTA: u64 = 1500;
pub const DEFAULT_QUOTA_BUFFER: f64 = 0.95;
pub const DEFAULT_QUOTA_SUMMARY_SECS: u64 = 30 * 60;

/// Methods that stay allowed after the daily quota is spent (user intent).
pub const DEFAULT_PRIORITY_METHODS: &[&str] =
    &["turn_on", "turn_off", "set_mode", "set_target_humidity"];

// Call governor
pub const DEFAULT_MIN_SPACING_MS: u64 = 500;
pub const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 5_000;

/// Local accessors and event registration; never touch the network.
pub const DEFAULT_BYPASS_METHODS: &[&str] =
    &["cached_devices", "device_name", "device_type", "is_online", "on_event"];

// Retry
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

// Polling
pub const DEFAULT_POLL_BASE_SECS: u64 = 60;
pub const DEFAULT_POLL_MIN_SECS: u64 = 15;
pub const DEFAULT_POLL_MAX_SECS: u64 = 900;
pub const DEFAULT_POLL_INACTIVE_MULTIPLIER: f64 = 3.0;
pub const DEFAULT_POLL_ERROR_PENALTY: f64 = 1.5;

// Token lifecycle
/// Largest delay a single timer hop may cover (2^31 - 1 ms, ~24.8 days).
pub const MAX_TIMER_HOP_MS: u64 = 2_147_483_647;
pub const DEFAULT_REFRESH_FLOOR_SECS: u64 = 30 * 60;

// Re-authentication
pub const DEFAULT_REAUTH_INITIAL_DELAY_SECS: u64 = 5;
pub const DEFAULT_REAUTH_MAX_DELAY_SECS: u64 = 300;
pub const DEFAULT_REAUTH_ESCALATE_AFTER: u32 = 5;

// Session persistence
pub const DEFAULT_SESSION_FILE: &str = "cloudbridge-session.json";
