//! Configuration loader
//!
//! Loads the governance configuration from a file and the environment.
//!
//! ## Loading Strategy
//! 1. Read a JSON or TOML file (explicit path, or the first probed match)
//! 2. Fall back to built-in defaults when no file exists
//! 3. Apply `CLOUDBRIDGE_*` environment overrides
//! 4. Validate the result
//!
//! ## Environment Variables
//! - `CLOUDBRIDGE_ACCOUNT`: Account name used for login and the session
//!   identity tag
//! - `CLOUDBRIDGE_BASE_QUOTA`: Daily quota before per-device allowance
//! - `CLOUDBRIDGE_QUOTA_PER_DEVICE`: Daily allowance per device
//! - `CLOUDBRIDGE_QUOTA_BUFFER`: Fraction of the provider ceiling to use
//! - `CLOUDBRIDGE_MIN_SPACING_MS`: Minimum gap between outgoing calls
//! - `CLOUDBRIDGE_DEBOUNCE_MS`: Debounce window for identical calls
//! - `CLOUDBRIDGE_RETRY_ATTEMPTS`: Attempts per governed call
//! - `CLOUDBRIDGE_POLL_BASE_SECS`: Base poll interval
//! - `CLOUDBRIDGE_DYNAMIC_POLLING`: Slow down polling for idle classes
//!   (true/false)
//! - `CLOUDBRIDGE_PROACTIVE_REFRESH`: Refresh sessions ahead of expiry
//!   (true/false)
//! - `CLOUDBRIDGE_SESSION_PATH`: Session file location
//! - `CLOUDBRIDGE_LOG_FORMAT`: `pretty` or `json`
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./cloudbridge.json` or `./cloudbridge.toml` (current working
//!    directory)
//! 2. `./config.json` or `./config.toml` (current working directory)
//! 3. `../config.json` or `../config.toml` (parent directory)
//! 4. Relative to executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;

use cloudbridge_domain::{BridgeError, GovernanceConfig, LogFormat, Result};

/// Load configuration: file (or defaults), then environment overrides.
///
/// # Errors
/// Returns `BridgeError::Config` if:
/// - The probed file cannot be read or parsed
/// - An environment override has an invalid value
/// - The merged configuration does not validate
pub fn load() -> Result<GovernanceConfig> {
    let mut config = match probe_config_paths() {
        Some(path) => load_from_file(Some(path))?,
        None => {
            tracing::debug!("No config file found; using defaults");
            GovernanceConfig::default()
        }
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Fields missing from
/// the file keep their defaults.
///
/// # Errors
/// Returns `BridgeError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
pub fn load_from_file(path: Option<PathBuf>) -> Result<GovernanceConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(BridgeError::Config(format!("Config file not found: {}", p.display())));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            BridgeError::Config("No config file found in any of the standard locations".to_string())
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| BridgeError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

/// Overwrite fields from `CLOUDBRIDGE_*` variables that are set.
///
/// # Errors
/// Returns `BridgeError::Config` naming the first variable whose value does
/// not parse.
pub fn apply_env_overrides(config: &mut GovernanceConfig) -> Result<()> {
    if let Some(account) = env_string("CLOUDBRIDGE_ACCOUNT") {
        config.reauth.account = account;
    }
    if let Some(base) = env_parse("CLOUDBRIDGE_BASE_QUOTA")? {
        config.quota.base_quota = base;
    }
    if let Some(per_device) = env_parse("CLOUDBRIDGE_QUOTA_PER_DEVICE")? {
        config.quota.per_device_quota = per_device;
    }
    if let Some(buffer) = env_parse("CLOUDBRIDGE_QUOTA_BUFFER")? {
        config.quota.buffer_fraction = buffer;
    }
    if let Some(spacing) = env_parse("CLOUDBRIDGE_MIN_SPACING_MS")? {
        config.governor.min_spacing_ms = spacing;
    }
    if let Some(window) = env_parse("CLOUDBRIDGE_DEBOUNCE_MS")? {
        config.governor.debounce_window_ms = window;
    }
    if let Some(attempts) = env_parse("CLOUDBRIDGE_RETRY_ATTEMPTS")? {
        config.retry.max_attempts = attempts;
    }
    if let Some(base) = env_parse("CLOUDBRIDGE_POLL_BASE_SECS")? {
        config.polling.base_interval_secs = base;
    }
    if let Some(dynamic) = env_bool("CLOUDBRIDGE_DYNAMIC_POLLING")? {
        config.polling.dynamic_polling = dynamic;
    }
    if let Some(proactive) = env_bool("CLOUDBRIDGE_PROACTIVE_REFRESH")? {
        config.token.proactive_refresh = proactive;
    }
    if let Some(path) = env_string("CLOUDBRIDGE_SESSION_PATH") {
        config.session.path = PathBuf::from(path);
    }
    if let Some(format) = env_parse::<LogFormat>("CLOUDBRIDGE_LOG_FORMAT")? {
        config.logging.format = format;
    }
    Ok(())
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
///
/// # Errors
/// Returns `BridgeError::Config` if format is invalid or parsing fails.
fn parse_config(contents: &str, path: &Path) -> Result<GovernanceConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| BridgeError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| BridgeError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(BridgeError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe multiple paths for configuration files
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(candidates_in(&cwd));
        candidates.push(cwd.join("../config.json"));
        candidates.push(cwd.join("../config.toml"));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.extend(candidates_in(exe_dir));
        }
    }

    candidates.into_iter().find(|path| path.exists())
}

fn candidates_in(dir: &Path) -> [PathBuf; 4] {
    [
        dir.join("cloudbridge.json"),
        dir.join("cloudbridge.toml"),
        dir.join("config.json"),
        dir.join("config.toml"),
    ]
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse an optional environment variable.
///
/// # Errors
/// Returns `BridgeError::Config` if the variable is set but does not parse.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| BridgeError::Config(format!("Invalid value for {key}: {e}")))
        })
        .transpose()
}

/// Parse an optional boolean environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
/// (case-insensitive).
///
/// # Errors
/// Returns `BridgeError::Config` for any other value.
fn env_bool(key: &str) -> Result<Option<bool>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(BridgeError::Config(format!("Invalid boolean for {key}: {other}"))),
    }
}
