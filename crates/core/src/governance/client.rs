//! Governed view of the device-cloud client
//!
//! [`GovernedClient`] mirrors the client's surface and routes every networked
//! call through the [`CallGovernor`]. Devices it lists come back as
//! [`GovernedDevice`] handles whose calls are governed the same way.

use std::future::Future;
use std::sync::Arc;

use cloudbridge_domain::{
    CallOutcome, DeviceCommand, DeviceDetails, DeviceId, DeviceInfo, DeviceKind, Result,
};
use tracing::warn;

use super::governor::{CallGovernor, CallValue};
use crate::auth::ReauthManager;
use crate::ports::DeviceCloudClient;

/// Device-cloud client with quota, spacing, debounce and retry applied
#[derive(Clone)]
pub struct GovernedClient {
    client: Arc<dyn DeviceCloudClient>,
    governor: CallGovernor,
    reauth: Option<ReauthManager>,
}

impl GovernedClient {
    pub fn new(client: Arc<dyn DeviceCloudClient>, governor: CallGovernor) -> Self {
        Self { client, governor, reauth: None }
    }

    /// Re-authenticate and retry once when a call fails with an expired
    /// session.
    pub fn with_reauth(mut self, reauth: ReauthManager) -> Self {
        self.reauth = Some(reauth);
        self
    }

    pub fn governor(&self) -> &CallGovernor {
        &self.governor
    }

    /// Devices from the client's last listing. Never governed.
    pub fn cached_devices(&self) -> Vec<DeviceInfo> {
        self.client.cached_devices()
    }

    /// List the account's devices, each wrapped as a governed handle.
    ///
    /// # Errors
    /// The underlying call's error once retries are exhausted.
    pub async fn list_devices(&self) -> Result<CallOutcome<Vec<GovernedDevice>>> {
        let client = Arc::clone(&self.client);
        let outcome = self
            .governed("list_devices", None, serde_json::Value::Null, move || {
                let client = Arc::clone(&client);
                async move { client.list_devices().await.map(|devices| devices.map(CallValue::Devices)) }
            })
            .await?;

        outcome.try_map(|value| -> Result<Vec<GovernedDevice>> {
            Ok(value
                .into_devices()?
                .into_iter()
                .map(|info| GovernedDevice { info, client: self.clone() })
                .collect())
        })
    }

    /// # Errors
    /// The underlying call's error once retries are exhausted.
    pub async fn device_details(&self, id: &DeviceId) -> Result<CallOutcome<DeviceDetails>> {
        let client = Arc::clone(&self.client);
        let target = id.clone();
        let outcome = self
            .governed("device_details", Some(id), serde_json::Value::Null, move || {
                let client = Arc::clone(&client);
                let target = target.clone();
                async move {
                    client.device_details(&target).await.map(|details| details.map(CallValue::Details))
                }
            })
            .await?;

        outcome.try_map(CallValue::into_details)
    }

    /// Send `command` to device `id`.
    ///
    /// # Errors
    /// The underlying call's error once retries are exhausted.
    pub async fn send_command(&self, id: &DeviceId, command: DeviceCommand) -> Result<CallOutcome<bool>> {
        let client = Arc::clone(&self.client);
        let target = id.clone();
        let method = command.method();
        let args = command.args();
        let outcome = self
            .governed(method, Some(id), args, move || {
                let client = Arc::clone(&client);
                let target = target.clone();
                let command = command.clone();
                async move { client.send_command(&target, &command).await.map(|ack| ack.map(CallValue::Ack)) }
            })
            .await?;

        outcome.try_map(CallValue::into_ack)
    }

    pub async fn turn_on(&self, id: &DeviceId) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::TurnOn).await
    }

    pub async fn turn_off(&self, id: &DeviceId) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::TurnOff).await
    }

    pub async fn set_brightness(&self, id: &DeviceId, level: u8) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::SetBrightness(level)).await
    }

    pub async fn set_mode(&self, id: &DeviceId, mode: impl Into<String>) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::SetMode(mode.into())).await
    }

    pub async fn set_fan_speed(&self, id: &DeviceId, speed: u8) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::SetFanSpeed(speed)).await
    }

    pub async fn set_target_humidity(&self, id: &DeviceId, percent: u8) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::SetTargetHumidity(percent)).await
    }

    pub async fn set_color_temperature(&self, id: &DeviceId, kelvin: u16) -> Result<CallOutcome<bool>> {
        self.send_command(id, DeviceCommand::SetColorTemperature(kelvin)).await
    }

    async fn governed<F, Fut>(
        &self,
        method: &str,
        device: Option<&DeviceId>,
        args: serde_json::Value,
        operation: F,
    ) -> Result<CallOutcome<CallValue>>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CallValue>>> + Send + 'static,
    {
        let result = self.governor.call(method, device, args.clone(), operation.clone()).await;

        match (result, &self.reauth) {
            (Err(err), Some(reauth)) if err.is_session_expired() => {
                warn!(method, error = %err, "Session expired; re-authenticating and retrying once");
                reauth.reauthenticate().await?;
                self.governor.call(method, device, args, operation).await
            }
            (result, _) => result,
        }
    }
}

impl std::fmt::Debug for GovernedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernedClient")
            .field("governor", &self.governor)
            .field("reauth", &self.reauth.is_some())
            .finish_non_exhaustive()
    }
}

/// A listed device whose calls go through the governor
#[derive(Debug, Clone)]
pub struct GovernedDevice {
    info: DeviceInfo,
    client: GovernedClient,
}

impl GovernedDevice {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.info.kind
    }

    pub fn is_online(&self) -> bool {
        self.info.online
    }

    pub async fn details(&self) -> Result<CallOutcome<DeviceDetails>> {
        self.client.device_details(&self.info.id).await
    }

    pub async fn send_command(&self, command: DeviceCommand) -> Result<CallOutcome<bool>> {
        self.client.send_command(&self.info.id, command).await
    }

    pub async fn turn_on(&self) -> Result<CallOutcome<bool>> {
        self.client.turn_on(&self.info.id).await
    }

    pub async fn turn_off(&self) -> Result<CallOutcome<bool>> {
        self.client.turn_off(&self.info.id).await
    }

    pub async fn set_brightness(&self, level: u8) -> Result<CallOutcome<bool>> {
        self.client.set_brightness(&self.info.id, level).await
    }

    pub async fn set_mode(&self, mode: impl Into<String>) -> Result<CallOutcome<bool>> {
        self.client.set_mode(&self.info.id, mode).await
    }

    pub async fn set_fan_speed(&self, speed: u8) -> Result<CallOutcome<bool>> {
        self.client.set_fan_speed(&self.info.id, speed).await
    }

    pub async fn set_target_humidity(&self, percent: u8) -> Result<CallOutcome<bool>> {
        self.client.set_target_humidity(&self.info.id, percent).await
    }

    pub async fn set_color_temperature(&self, kelvin: u16) -> Result<CallOutcome<bool>> {
        self.client.set_color_temperature(&self.info.id, kelvin).await
    }
}
