//! Device identities, state and commands

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::impl_label_conversions;

/// Cloud-assigned device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Device class; each class gets its own poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Outlet,
    Bulb,
    Fan,
    Purifier,
    Humidifier,
}

impl_label_conversions!(DeviceKind {
    Outlet => "outlet",
    Bulb => "bulb",
    Fan => "fan",
    Purifier => "purifier",
    Humidifier => "humidifier",
});

/// Device listing entry as returned by the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub model: String,
    pub online: bool,
}

/// Last known device state
///
/// Fields a device type does not support stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub power: bool,
    pub brightness: Option<u8>,
    pub color_temperature: Option<u16>,
    pub mode: Option<String>,
    pub fan_speed: Option<u8>,
    pub humidity: Option<u8>,
    pub target_humidity: Option<u8>,
}

/// A state-changing request for a single device
///
/// Serializes as `{"method": ..., "args": ...}`; the method name and the
/// serialized args form the debounce key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    SetBrightness(u8),
    SetMode(String),
    SetFanSpeed(u8),
    SetTargetHumidity(u8),
    SetColorTemperature(u16),
}

impl DeviceCommand {
    /// Method name the command maps to on the cloud client.
    pub fn method(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::SetBrightness(_) => "set_brightness",
            Self::SetMode(_) => "set_mode",
            Self::SetFanSpeed(_) => "set_fan_speed",
            Self::SetTargetHumidity(_) => "set_target_humidity",
            Self::SetColorTemperature(_) => "set_color_temperature",
        }
    }

    /// Argument list as a JSON value (`null` for argument-free commands).
    pub fn args(&self) -> serde_json::Value {
        match self {
            Self::TurnOn | Self::TurnOff => serde_json::Value::Null,
            Self::SetBrightness(v) | Self::SetFanSpeed(v) | Self::SetTargetHumidity(v) => {
                serde_json::json!([v])
            }
            Self::SetMode(mode) => serde_json::json!([mode]),
            Self::SetColorTemperature(kelvin) => serde_json::json!([kelvin]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_method_matches_serde_tag() {
        let json = serde_json::to_value(DeviceCommand::SetBrightness(40)).unwrap();
        assert_eq!(json["method"], "set_brightness");
        assert_eq!(DeviceCommand::SetBrightness(40).method(), "set_brightness");
        assert_eq!(DeviceCommand::SetTargetHumidity(55).method(), "set_target_humidity");
    }

    #[test]
    fn test_command_args() {
        assert_eq!(DeviceCommand::TurnOn.args(), serde_json::Value::Null);
        assert_eq!(DeviceCommand::SetMode("sleep".into()).args(), serde_json::json!(["sleep"]));
        assert_eq!(DeviceCommand::SetFanSpeed(3).args(), serde_json::json!([3]));
    }

    #[test]
    fn test_device_id_is_transparent() {
        let id = DeviceId::new("cid-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"cid-1\"");
        assert_eq!(id.to_string(), "cid-1");
    }

    #[test]
    fn test_device_kind_labels() {
        assert_eq!(DeviceKind::Humidifier.to_string(), "humidifier");
        assert_eq!("Purifier".parse::<DeviceKind>().unwrap(), DeviceKind::Purifier);
    }
}
