//! Shared test helpers for `cloudbridge-core` integration tests.
//!
//! In-memory stand-ins for the device cloud, the login flow and the session
//! store, wired so a "revoked" session on the cloud side is cleared by the
//! next successful login.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use cloudbridge_core::{Authenticator, DeviceCloudClient, SessionStore};
use cloudbridge_domain::{
    BridgeError, DeviceCommand, DeviceDetails, DeviceId, DeviceInfo, DeviceKind, Result, Session,
};
use parking_lot::Mutex;

pub const ACCOUNT: &str = "user@example.com";

/// Structured token whose payload carries `iat`/`exp`.
pub fn token_expiring(expires_at: DateTime<Utc>, nonce: u32) -> String {
    let payload = format!(r#"{{"iat":{},"exp":{}}}"#, nonce, expires_at.timestamp());
    format!("eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl", URL_SAFE_NO_PAD.encode(payload))
}

pub fn device(id: &str, kind: DeviceKind) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId::from(id),
        name: format!("{kind} {id}"),
        kind,
        model: "ESW15-USA".to_string(),
        online: true,
    }
}

/// Device cloud that records every request it receives.
pub struct MockCloudClient {
    devices: Vec<DeviceInfo>,
    requests: Mutex<Vec<String>>,
    session_valid: Arc<AtomicBool>,
    latency: Duration,
}

impl MockCloudClient {
    pub fn new(devices: Vec<DeviceInfo>, session_valid: Arc<AtomicBool>) -> Self {
        Self { devices, requests: Mutex::new(Vec::new()), session_valid, latency: Duration::from_millis(100) }
    }

    /// Requests seen so far, as `method[:device]`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, prefix: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.starts_with(prefix)).count()
    }

    /// Make every request fail as unauthorized until the next login.
    pub fn revoke_session(&self) {
        self.session_valid.store(false, Ordering::SeqCst);
    }

    async fn handle(&self, request: String) -> Result<()> {
        self.requests.lock().push(request);
        tokio::time::sleep(self.latency).await;
        if self.session_valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Network("HTTP status 401: token expired".into()))
        }
    }
}

#[async_trait]
impl DeviceCloudClient for MockCloudClient {
    async fn list_devices(&self) -> Result<Option<Vec<DeviceInfo>>> {
        self.handle("list_devices".into()).await?;
        Ok(Some(self.devices.clone()))
    }

    async fn device_details(&self, id: &DeviceId) -> Result<Option<DeviceDetails>> {
        self.handle(format!("device_details:{id}")).await?;
        Ok(Some(DeviceDetails { power: true, brightness: Some(80), ..DeviceDetails::default() }))
    }

    async fn send_command(&self, id: &DeviceId, command: &DeviceCommand) -> Result<Option<bool>> {
        self.handle(format!("{}:{id}", command.method())).await?;
        Ok(Some(true))
    }

    fn cached_devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}

/// Login flow issuing 30-day tokens; adopting a session re-validates the
/// cloud side.
pub struct MockAuthenticator {
    logins: AtomicU32,
    adopted: Mutex<Vec<Session>>,
    session_valid: Arc<AtomicBool>,
}

impl MockAuthenticator {
    pub fn new(session_valid: Arc<AtomicBool>) -> Self {
        Self { logins: AtomicU32::new(0), adopted: Mutex::new(Vec::new()), session_valid }
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn adopted(&self) -> Vec<Session> {
        self.adopted.lock().clone()
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn login(&self, _account: &str) -> Result<Session> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(30);
        Ok(Session {
            token: token_expiring(expires_at, n),
            account_id: "1234567".into(),
            region: "US".into(),
            issued_at: now,
            expires_at,
            identity: String::new(),
        })
    }

    async fn adopt_session(&self, session: &Session) -> Result<()> {
        self.adopted.lock().push(session.clone());
        self.session_valid.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Session store kept in memory.
#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
    saves: AtomicU32,
}

impl MemorySessionStore {
    pub fn with_session(session: Session) -> Self {
        Self { session: Mutex::new(Some(session)), saves: AtomicU32::new(0) }
    }

    pub fn stored(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, identity: &str) -> Result<Option<Session>> {
        Ok(self.session.lock().clone().filter(|s| s.identity == identity))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.session.lock() = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.lock() = None;
        Ok(())
    }
}
