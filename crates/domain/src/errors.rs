//! Error types used throughout the bridge

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cloud error codes that signal an expired or revoked session token.
const SESSION_EXPIRED_CODES: &[&str] = &["-11001000", "-11012022", "4001004"];

/// Main error type for the bridge
///
/// `Clone` so that a single failed call can be handed to every caller that
/// coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether this error carries the authentication/session-expired
    /// signature that should trigger a forced re-login.
    pub fn is_session_expired(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Network(msg) | Self::Internal(msg) => {
                let lower = msg.to_ascii_lowercase();
                lower.contains("token expired")
                    || lower.contains("unauthorized")
                    || lower.contains("status 401")
                    || SESSION_EXPIRED_CODES.iter().any(|code| msg.contains(code))
            }
            _ => false,
        }
    }

    /// Stable label suitable for structured log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
            Self::Storage(_) => "storage",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::EmptyResult(_) => "empty_result",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("Invalid JSON: {err}"))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_variant_is_session_expiry() {
        assert!(BridgeError::Auth("login required".into()).is_session_expired());
    }

    #[test]
    fn test_session_expiry_detected_from_message() {
        assert!(BridgeError::Network("HTTP status 401 from cloud".into()).is_session_expired());
        assert!(BridgeError::Network("Token Expired".into()).is_session_expired());
        assert!(BridgeError::Internal("code -11012022 returned".into()).is_session_expired());
    }

    #[test]
    fn test_transient_errors_are_not_session_expiry() {
        assert!(!BridgeError::Network("connection reset".into()).is_session_expired());
        assert!(!BridgeError::EmptyResult("no data".into()).is_session_expired());
        assert!(!BridgeError::Storage("status 401".into()).is_session_expired());
    }

    #[test]
    fn test_serde_shape_is_tagged() {
        let json = serde_json::to_string(&BridgeError::Network("down".into())).unwrap();
        assert_eq!(json, r#"{"type":"Network","message":"down"}"#);
    }
}
