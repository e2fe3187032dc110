//! Port interfaces for the governance layer
//!
//! These traits define the boundaries between the governance logic and the
//! device-cloud client, the login flow and session persistence.

use async_trait::async_trait;
use cloudbridge_domain::{DeviceCommand, DeviceDetails, DeviceId, DeviceInfo, Result, Session};

/// Raw device-cloud client
///
/// `Ok(None)` means the cloud answered without a usable payload; the governor
/// retries it like a failure.
#[async_trait]
pub trait DeviceCloudClient: Send + Sync {
    /// Fetch the account's device list
    async fn list_devices(&self) -> Result<Option<Vec<DeviceInfo>>>;

    /// Fetch the current state of one device
    async fn device_details(&self, id: &DeviceId) -> Result<Option<DeviceDetails>>;

    /// Send a state-changing command; the payload is the cloud's ack flag
    async fn send_command(&self, id: &DeviceId, command: &DeviceCommand) -> Result<Option<bool>>;

    /// Devices from the last successful listing; never touches the network
    fn cached_devices(&self) -> Vec<DeviceInfo>;
}

/// Login flow against the device cloud
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Perform a full login for `account`
    async fn login(&self, account: &str) -> Result<Session>;

    /// Install a session (fresh or restored) on the underlying client
    async fn adopt_session(&self, session: &Session) -> Result<()>;
}

/// Persistence for the current session
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the stored session if it belongs to `identity`
    async fn load(&self, identity: &str) -> Result<Option<Session>>;

    /// Persist `session`, replacing any previous one
    async fn save(&self, session: &Session) -> Result<()>;

    /// Remove the stored session
    async fn clear(&self) -> Result<()>;
}

/// Produces a fresh session when the current one nears expiry
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Session>;
}
