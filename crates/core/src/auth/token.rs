//! Session token claims and refresh planning
//!
//! Tokens are three dot-separated segments with a base64url JSON payload in
//! the middle. Only `iat` and `exp` are read; the signature is never checked
//! here.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Token decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token must have 3 segments, found {0}")]
    Malformed(usize),

    #[error("token payload is not valid base64url JSON: {0}")]
    Encoding(String),

    #[error("token payload is missing `{0}`")]
    MissingClaim(&'static str),
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    iat: Option<i64>,
    exp: Option<i64>,
}

/// Timestamps carried by a session token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    /// Time left before expiry as seen at `now`; zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Decode `iat`/`exp` from a token.
///
/// # Errors
/// Returns `TokenError` if the token is not three segments, the payload does
/// not decode, or `exp` is missing.
pub fn decode_token_claims(token: &str) -> Result<TokenClaims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::Malformed(segments.len()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| TokenError::Encoding(e.to_string()))?;
    let raw: RawClaims =
        serde_json::from_slice(&payload).map_err(|e| TokenError::Encoding(e.to_string()))?;

    let exp = raw.exp.ok_or(TokenError::MissingClaim("exp"))?;
    let expires_at = Utc
        .timestamp_opt(exp, 0)
        .single()
        .ok_or(TokenError::Encoding(format!("exp {exp} is out of range")))?;
    let issued_at = raw.iat.and_then(|iat| Utc.timestamp_opt(iat, 0).single());

    Ok(TokenClaims { issued_at, expires_at })
}

/// What to do about a token with a given lifetime left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Refresh after `refresh_in`, which is `lead` before expiry (or the
    /// floor, whichever is later).
    Scheduled { refresh_in: Duration, lead: Duration },
    /// Too close to expiry to schedule; wait for a rejected call.
    Reactive,
}

/// Tiered lead policy.
///
/// | remaining      | lead     |
/// |----------------|----------|
/// | > 7 days       | 5 days   |
/// | 1 to 7 days    | 12 hours |
/// | 1 to 24 hours  | 1 hour   |
/// | < 1 hour       | reactive |
///
/// The resulting delay is never shorter than `floor`.
pub fn plan_refresh(remaining: Duration, floor: Duration) -> RefreshPlan {
    let lead = if remaining > 7 * DAY {
        5 * DAY
    } else if remaining >= DAY {
        12 * HOUR
    } else if remaining >= HOUR {
        HOUR
    } else {
        return RefreshPlan::Reactive;
    };

    let refresh_in = remaining.saturating_sub(lead).max(floor);
    RefreshPlan::Scheduled { refresh_in, lead }
}
