//! Tracing subscriber initialisation
//!
//! `RUST_LOG` wins when set; otherwise the configured fallback filter is
//! used. Installing a second subscriber is reported as an error, never a
//! panic, so tests and embedding hosts can call this freely.

use cloudbridge_domain::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging initialisation errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter `{filter}`: {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Install the global subscriber with the default `info` filter.
///
/// # Errors
/// `LoggingError::AlreadyInitialized` if a subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), LoggingError> {
    init_tracing_with(&LoggingConfig { format, ..LoggingConfig::default() })
}

/// Install the global subscriber from a logging section.
///
/// # Errors
/// `LoggingError::InvalidFilter` if the fallback filter does not parse;
/// `LoggingError::AlreadyInitialized` if a subscriber is already set.
pub fn init_tracing_with(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config.filter)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    installed.map_err(|_| LoggingError::AlreadyInitialized)?;
    tracing::debug!(format = %config.format, "Tracing initialised");
    Ok(())
}

/// `RUST_LOG` if set and valid, else `fallback`.
///
/// # Errors
/// `LoggingError::InvalidFilter` if `fallback` does not parse.
pub fn build_filter(fallback: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(fallback).map_err(|e| LoggingError::InvalidFilter {
        filter: fallback.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_reported() {
        // Either this test installs the subscriber or another test did.
        let _ = init_tracing(LogFormat::Pretty);
        assert!(matches!(init_tracing(LogFormat::Json), Err(LoggingError::AlreadyInitialized)));
    }

    #[test]
    fn test_fallback_filter_must_parse() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_filter("cloudbridge_core=debug,info").is_ok());
        assert!(matches!(build_filter("cloudbridge_core=loud"), Err(LoggingError::InvalidFilter { .. })));
    }
}
