use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control-channel message as it arrives on the shared topic.
///
/// Every field is optional on the wire; missing values take the same
/// defaults the deployed controllers rely on (relay 0, empty action,
/// zero duration).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    #[serde(rename = "deviceId", default)]
    pub device_id: String,
    #[serde(default)]
    pub relay: i64,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    On,
    Off,
    Toggle,
    TimerSeconds(u64),
}

impl RelayAction {
    /// Maps the wire `action`/`duration` pair. Unknown actions yield `None`.
    pub fn from_wire(action: &str, duration: Option<u64>) -> Option<Self> {
        match action {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            "timer" => Some(Self::TimerSeconds(duration.unwrap_or(0))),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
            Self::TimerSeconds(_) => "timer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub target_device_id: String,
    pub relay_index: i64,
    pub action: Option<RelayAction>,
}

impl From<ControlMessage> for InboundCommand {
    fn from(message: ControlMessage) -> Self {
        let action = RelayAction::from_wire(&message.action, message.duration);
        Self {
            target_device_id: message.device_id,
            relay_index: message.relay,
            action,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayStatusPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub relay: i64,
    pub state: bool,
    pub timer: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub index: usize,
    pub state: bool,
    pub timer: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceStatusPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub ip: String,
    pub rssi: i32,
    pub uptime: u64,
    pub timestamp: u64,
    pub relays: Vec<RelaySnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialsPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub username: String,
    pub password: String,
    pub timestamp: u64,
}

/// `POST /configure` body. Missing fields read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub ssid: String,
    pub password: String,
    pub username: String,
    pub user_password: String,
}

impl ConfigureRequest {
    /// Reads every field on its own so one badly typed value cannot wipe the
    /// others. Numbers keep their text form; anything else reads as empty.
    pub fn from_value(body: &Value) -> Self {
        let field = |key: &str| match body.get(key) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => String::new(),
        };

        Self {
            ssid: field("ssid"),
            password: field("password"),
            username: field("username"),
            user_password: field("user_password"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigureResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResponse {
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_defaults_missing_fields() {
        let message: ControlMessage = serde_json::from_str(r#"{"deviceId":"GT-1"}"#).unwrap();
        let command = InboundCommand::from(message);

        assert_eq!(command.target_device_id, "GT-1");
        assert_eq!(command.relay_index, 0);
        assert_eq!(command.action, None);
    }

    #[test]
    fn timer_without_duration_is_zero_seconds() {
        assert_eq!(
            RelayAction::from_wire("timer", None),
            Some(RelayAction::TimerSeconds(0))
        );
        assert_eq!(RelayAction::from_wire("ON", None), None);
    }

    #[test]
    fn relay_status_uses_camel_case_device_id() {
        let payload = RelayStatusPayload {
            device_id: "GT-abc".to_string(),
            relay: 3,
            state: true,
            timer: 6_000,
            timestamp: 1_000,
        };
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "deviceId": "GT-abc",
                "relay": 3,
                "state": true,
                "timer": 6000,
                "timestamp": 1000
            })
        );
    }

    #[test]
    fn configure_fields_are_read_independently() {
        let body = serde_json::json!({
            "ssid": "home",
            "password": 12345678,
            "username": ["op"],
            "user_password": "pw"
        });

        assert_eq!(
            ConfigureRequest::from_value(&body),
            ConfigureRequest {
                ssid: "home".to_string(),
                password: "12345678".to_string(),
                username: String::new(),
                user_password: "pw".to_string(),
            }
        );
    }
}
