//! Integration tests for domain wire formats
//!
//! Covers the JSON shapes other processes depend on: the persisted session
//! document, tagged errors and device commands.

use chrono::{TimeZone, Utc};
use cloudbridge_domain::{BridgeError, DeviceCommand, GovernanceConfig, Session};

/// Validates the persisted session document layout.
///
/// # Test Steps
/// 1. Serialize a session
/// 2. Verify camelCase field names and identity tag
/// 3. Deserialize it back and compare
#[test]
fn test_session_document_shape() {
    let session = Session {
        token: "header.payload.sig".into(),
        account_id: "1234".into(),
        region: "EU".into(),
        issued_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        expires_at: Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap(),
        identity: Session::identity_for("owner@example.com"),
    };

    let json = serde_json::to_value(&session).unwrap();
    assert_eq!(json["accountId"], "1234");
    assert!(json.get("issuedAt").is_some());
    assert!(json.get("expiresAt").is_some());
    assert_eq!(json["identity"].as_str().map(str::len), Some(64));

    let back: Session = serde_json::from_value(json).unwrap();
    assert_eq!(back, session);
    assert!(back.belongs_to("Owner@Example.com"));
}

/// Validates that errors survive a JSON hop with their session-expired
/// classification intact.
#[test]
fn test_error_tagging_preserves_classification() {
    let err = BridgeError::Network("request failed: status 401".into());
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"type\":\"Network\""));

    let back: BridgeError = serde_json::from_str(&json).unwrap();
    assert!(back.is_session_expired());
    assert!(!BridgeError::Network("connection reset".into()).is_session_expired());
}

/// Validates command serialization used for debounce keys.
#[test]
fn test_command_json_is_stable() {
    let json = serde_json::to_string(&DeviceCommand::SetMode("sleep".into())).unwrap();
    assert_eq!(json, r#"{"method":"set_mode","args":"sleep"}"#);
    assert_eq!(DeviceCommand::TurnOn.args(), serde_json::Value::Null);
}

/// Validates that a JSON config file with a single section keeps the
/// remaining defaults.
#[test]
fn test_json_config_partial_section() {
    let config: GovernanceConfig =
        serde_json::from_str(r#"{"governor": {"min_spacing_ms": 250}}"#).unwrap();
    assert_eq!(config.governor.min_spacing_ms, 250);
    assert_eq!(config.governor.debounce_window_ms, 5_000);
    assert!(config.validate().is_ok());
}
