//! Authenticated session with the device cloud

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Credential issued by a successful login
///
/// Persisted as a small JSON document. `identity` tags the account the
/// session belongs to so a file written for one account is never hydrated
/// for another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub account_id: String,
    pub region: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub identity: String,
}

impl Session {
    /// Identity tag for an account name (SHA-256 of the lower-cased name).
    pub fn identity_for(account: &str) -> String {
        let digest = Sha256::digest(account.trim().to_lowercase().as_bytes());
        hex::encode(digest)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn belongs_to(&self, account: &str) -> bool {
        self.identity == Self::identity_for(account)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session(expires_in: Duration) -> Session {
        let now = Utc::now();
        Session {
            token: "t".into(),
            account_id: "42".into(),
            region: "US".into(),
            issued_at: now,
            expires_at: now + expires_in,
            identity: Session::identity_for("User@Example.com"),
        }
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        assert_eq!(Session::identity_for("User@Example.com"), Session::identity_for("user@example.com "));
        assert_ne!(Session::identity_for("a@example.com"), Session::identity_for("b@example.com"));
    }

    #[test]
    fn test_belongs_to() {
        let s = session(Duration::days(1));
        assert!(s.belongs_to("user@example.com"));
        assert!(!s.belongs_to("other@example.com"));
    }

    #[test]
    fn test_expiry() {
        let s = session(Duration::hours(1));
        assert!(!s.is_expired_at(Utc::now()));
        assert!(s.is_expired_at(Utc::now() + Duration::hours(2)));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(session(Duration::days(1))).unwrap();
        assert!(json.get("accountId").is_some());
        assert!(json.get("expiresAt").is_some());
        assert!(json.get("identity").is_some());
    }
}
