use serde::{Deserialize, Serialize};

pub const DEFAULT_RELAY_PINS: [i32; 20] = [
    2, 4, 5, 12, 13, 14, 15, 16, 17, 18, 19, 21, 22, 23, 25, 26, 27, 32, 33, 35,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub wifi_connect_attempts: u32,
    pub wifi_probe_interval_ms: u64,
    pub station_retry_backoff_ms: u64,
    pub broker_retry_interval_ms: u64,
    pub broker_timeout_ms: u64,
    pub device_status_interval_ms: u64,
    pub credentials_retry_interval_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wifi_connect_attempts: 20,
            wifi_probe_interval_ms: 1_000,
            station_retry_backoff_ms: 10_000,
            broker_retry_interval_ms: 1_000,
            broker_timeout_ms: 10_000,
            device_status_interval_ms: 30_000,
            credentials_retry_interval_ms: 60_000,
            restart_delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub max_payload_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "34.229.153.185".to_string(),
            port: 1883,
            max_payload_bytes: 512,
        }
    }
}

/// Fixed-credential access point broadcast while the device is in setup mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "green-tech".to_string(),
            password: "12345678".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub relay_pins: Vec<i32>,
    pub timing: TimingConfig,
    pub broker: BrokerConfig,
    pub access_point: AccessPointConfig,
    pub store_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            relay_pins: DEFAULT_RELAY_PINS.to_vec(),
            timing: TimingConfig::default(),
            broker: BrokerConfig::default(),
            access_point: AccessPointConfig::default(),
            store_namespace: "green-tech".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn relay_count(&self) -> usize {
        self.relay_pins.len()
    }

    pub fn sanitize(&mut self) {
        self.timing.sanitize();

        if self.broker.port == 0 {
            self.broker.port = 1883;
        }
        self.broker.max_payload_bytes = self.broker.max_payload_bytes.max(64);

        if self.store_namespace.trim().is_empty() {
            self.store_namespace = "green-tech".to_string();
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.wifi_connect_attempts = self.wifi_connect_attempts.max(1);
        self.wifi_probe_interval_ms = self.wifi_probe_interval_ms.max(1);
        self.station_retry_backoff_ms = self.station_retry_backoff_ms.max(1);
        self.broker_timeout_ms = self.broker_timeout_ms.max(1_000);
        self.device_status_interval_ms = self.device_status_interval_ms.max(1);
        self.credentials_retry_interval_ms = self.credentials_retry_interval_ms.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pin_map_has_twenty_relays() {
        let config = ControllerConfig::default();
        assert_eq!(config.relay_count(), 20);
        assert_eq!(config.relay_pins[19], 35);
    }

    #[test]
    fn sanitize_repairs_degenerate_values() {
        let mut config = ControllerConfig::default();
        config.timing.wifi_connect_attempts = 0;
        config.timing.wifi_probe_interval_ms = 0;
        config.broker.port = 0;
        config.broker.max_payload_bytes = 4;
        config.store_namespace = "  ".to_string();

        config.sanitize();

        assert_eq!(config.timing.wifi_connect_attempts, 1);
        assert_eq!(config.timing.wifi_probe_interval_ms, 1);
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.max_payload_bytes, 64);
        assert_eq!(config.store_namespace, "green-tech");
    }

    #[test]
    fn partial_json_falls_back_to_section_defaults() {
        let raw = r#"{"relay_pins":[2,4],"store_namespace":"bench"}"#;
        let config: ControllerConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.relay_count(), 2);
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.access_point.ssid, "green-tech");
    }

    #[test]
    fn nested_partial_json_keeps_remaining_defaults() {
        let raw = r#"{"broker":{"host":"10.0.0.5"},"timing":{"wifi_connect_attempts":5}}"#;
        let config: ControllerConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.timing.wifi_connect_attempts, 5);
        assert_eq!(config.timing.restart_delay_ms, 3_000);
        assert_eq!(config.relay_count(), 20);
    }
}
