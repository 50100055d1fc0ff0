use thiserror::Error;

use crate::{
    config::{AccessPointConfig, ControllerConfig},
    store::Credentials,
    topics::TOPIC_RELAY_CONTROL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Uninitialized,
    SetupMode,
    ConnectingStation,
    StationConnected,
    BrokerConnecting,
    BrokerConnected,
    StationLost,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::SetupMode => "SETUP_MODE",
            Self::ConnectingStation => "CONNECTING_STATION",
            Self::StationConnected => "STATION_CONNECTED",
            Self::BrokerConnecting => "BROKER_CONNECTING",
            Self::BrokerConnected => "BROKER_CONNECTED",
            Self::StationLost => "STATION_LOST",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("no station credentials configured")]
    NoCredentials,
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("broker handshake pending")]
    HandshakePending,
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("payload encoding failed: {0}")]
    Encode(String),
}

/// WiFi radio: station association plus the setup access point.
///
/// Every call must return promptly; association progress is observed through
/// `is_connected` on later ticks.
pub trait StationLink {
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn start_access_point(&mut self, access_point: &AccessPointConfig) -> Result<(), LinkError>;
    fn scan(&mut self) -> Result<Vec<String>, LinkError>;
    fn ip_address(&self) -> Option<String>;
    fn rssi(&self) -> Option<i32>;
}

pub trait Publisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Pub/sub session. `connect` is a single bounded attempt; the implementation
/// owns the socket timeout.
pub trait BrokerLink: Publisher {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;
    fn poll_inbound(&mut self) -> Vec<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    AccessPointStarted { ssid: String },
    AccessPointFailed(LinkError),
    SetupModeEntered { retry_at_ms: Option<u64> },
    AssociationStarted { ssid: String },
    AssociationFailed(LinkError),
    AssociationAttempt { attempt: u32, max: u32 },
    AssociationExhausted { attempts: u32 },
    StationConnected { ip: Option<String> },
    StationLost,
    BrokerConnected,
    BrokerConnectFailed(BrokerError),
    BrokerLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub max_attempts: u32,
    pub probe_interval_ms: u64,
    pub station_backoff_ms: u64,
    pub broker_retry_ms: u64,
    pub control_topic: String,
    pub access_point: AccessPointConfig,
}

impl SupervisorSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            max_attempts: config.timing.wifi_connect_attempts.max(1),
            probe_interval_ms: config.timing.wifi_probe_interval_ms,
            station_backoff_ms: config.timing.station_retry_backoff_ms,
            broker_retry_ms: config.timing.broker_retry_interval_ms,
            control_topic: TOPIC_RELAY_CONTROL.to_string(),
            access_point: config.access_point.clone(),
        }
    }
}

/// Owns the connectivity state and advances it one step per scheduler tick.
///
/// Retries are deadlines compared against the caller's clock, so a tick never
/// waits. Once configured, the device is never left without a path back: a
/// failed or lost station link brings the setup access point up and keeps
/// re-associating in the background.
#[derive(Debug)]
pub struct ConnectivitySupervisor {
    settings: SupervisorSettings,
    client_id: String,
    state: ConnectivityState,
    station: Option<(String, String)>,
    attempts: u32,
    next_probe_ms: u64,
    next_broker_attempt_ms: u64,
    station_retry_at_ms: Option<u64>,
    access_point_active: bool,
}

impl ConnectivitySupervisor {
    pub fn new(settings: SupervisorSettings, client_id: impl Into<String>) -> Self {
        Self {
            settings,
            client_id: client_id.into(),
            state: ConnectivityState::Uninitialized,
            station: None,
            attempts: 0,
            next_probe_ms: 0,
            next_broker_attempt_ms: 0,
            station_retry_at_ms: None,
            access_point_active: false,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn access_point_active(&self) -> bool {
        self.access_point_active
    }

    pub fn station_up(&self) -> bool {
        matches!(
            self.state,
            ConnectivityState::StationConnected
                | ConnectivityState::BrokerConnecting
                | ConnectivityState::BrokerConnected
        )
    }

    pub fn broker_connected(&self) -> bool {
        self.state == ConnectivityState::BrokerConnected
    }

    /// Leaves `Uninitialized`. Unconfigured devices (or ones without an SSID)
    /// stay in setup mode for good; configured ones start associating.
    pub fn start(
        &mut self,
        configured: bool,
        credentials: &Credentials,
        now_ms: u64,
        station: &mut impl StationLink,
    ) -> Vec<ConnectivityEvent> {
        let mut events = Vec::new();

        if configured && credentials.has_station() {
            self.station = Some((
                credentials.ssid.clone(),
                credentials.wifi_password.clone(),
            ));
            self.begin_association(now_ms, station, &mut events);
        } else {
            if configured {
                events.push(ConnectivityEvent::AssociationFailed(LinkError::NoCredentials));
            }
            self.station = None;
            self.enter_setup_mode(None, station, &mut events);
        }

        events
    }

    pub fn tick(
        &mut self,
        now_ms: u64,
        station: &mut impl StationLink,
        broker: &mut impl BrokerLink,
    ) -> Vec<ConnectivityEvent> {
        let mut events = Vec::new();

        match self.state {
            ConnectivityState::Uninitialized => {}
            ConnectivityState::SetupMode => {
                if self.station.is_some() && station.is_connected() {
                    self.station_retry_at_ms = None;
                    self.attempts = 0;
                    self.state = ConnectivityState::StationConnected;
                    events.push(ConnectivityEvent::StationConnected {
                        ip: station.ip_address(),
                    });
                } else if let Some(retry_at) = self.station_retry_at_ms {
                    if now_ms >= retry_at {
                        self.station_retry_at_ms = None;
                        self.begin_association(now_ms, station, &mut events);
                    }
                }
            }
            ConnectivityState::ConnectingStation => {
                self.probe_station(now_ms, station, &mut events);
            }
            ConnectivityState::StationConnected => {
                self.state = ConnectivityState::BrokerConnecting;
                self.next_broker_attempt_ms = now_ms;
                self.attempt_broker(now_ms, broker, &mut events);
            }
            ConnectivityState::BrokerConnecting => {
                if station.is_connected() {
                    self.attempt_broker(now_ms, broker, &mut events);
                } else {
                    self.mark_station_lost(&mut events);
                }
            }
            ConnectivityState::BrokerConnected => {
                if !station.is_connected() {
                    self.mark_station_lost(&mut events);
                } else if !broker.is_connected() {
                    self.state = ConnectivityState::BrokerConnecting;
                    self.next_broker_attempt_ms = now_ms;
                    events.push(ConnectivityEvent::BrokerLost);
                }
            }
            ConnectivityState::StationLost => {
                self.ensure_access_point(station, &mut events);
                self.begin_association(now_ms, station, &mut events);
            }
        }

        events
    }

    /// Drains inbound broker messages and hands each one to `handle`.
    /// Returns the number of messages delivered.
    pub fn pump_inbound<B: BrokerLink>(
        &self,
        broker: &mut B,
        mut handle: impl FnMut(&[u8], &mut B),
    ) -> usize {
        if !self.broker_connected() {
            return 0;
        }

        let messages = broker.poll_inbound();
        for message in &messages {
            handle(message, broker);
        }
        messages.len()
    }

    fn begin_association(
        &mut self,
        now_ms: u64,
        station: &mut impl StationLink,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        let Some((ssid, password)) = self.station.as_ref() else {
            self.enter_setup_mode(None, station, events);
            return;
        };

        match station.begin(ssid, password) {
            Ok(()) => events.push(ConnectivityEvent::AssociationStarted { ssid: ssid.clone() }),
            Err(err) => events.push(ConnectivityEvent::AssociationFailed(err)),
        }

        self.state = ConnectivityState::ConnectingStation;
        self.attempts = 0;
        self.next_probe_ms = now_ms.saturating_add(self.settings.probe_interval_ms);
    }

    fn probe_station(
        &mut self,
        now_ms: u64,
        station: &mut impl StationLink,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        if now_ms < self.next_probe_ms {
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        events.push(ConnectivityEvent::AssociationAttempt {
            attempt: self.attempts,
            max: self.settings.max_attempts,
        });

        if station.is_connected() {
            self.state = ConnectivityState::StationConnected;
            events.push(ConnectivityEvent::StationConnected {
                ip: station.ip_address(),
            });
            return;
        }

        if self.attempts >= self.settings.max_attempts {
            events.push(ConnectivityEvent::AssociationExhausted {
                attempts: self.attempts,
            });
            let retry_at = now_ms.saturating_add(self.settings.station_backoff_ms);
            self.enter_setup_mode(Some(retry_at), station, events);
            return;
        }

        self.next_probe_ms = now_ms.saturating_add(self.settings.probe_interval_ms);
    }

    fn attempt_broker(
        &mut self,
        now_ms: u64,
        broker: &mut impl BrokerLink,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        if now_ms < self.next_broker_attempt_ms {
            return;
        }

        let result = broker
            .connect(&self.client_id)
            .and_then(|()| broker.subscribe(&self.settings.control_topic));

        match result {
            Ok(()) => {
                self.state = ConnectivityState::BrokerConnected;
                events.push(ConnectivityEvent::BrokerConnected);
            }
            Err(err) => {
                self.next_broker_attempt_ms = now_ms.saturating_add(self.settings.broker_retry_ms);
                events.push(ConnectivityEvent::BrokerConnectFailed(err));
            }
        }
    }

    fn mark_station_lost(&mut self, events: &mut Vec<ConnectivityEvent>) {
        self.state = ConnectivityState::StationLost;
        events.push(ConnectivityEvent::StationLost);
    }

    fn enter_setup_mode(
        &mut self,
        retry_at_ms: Option<u64>,
        station: &mut impl StationLink,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        self.ensure_access_point(station, events);
        self.state = ConnectivityState::SetupMode;
        self.station_retry_at_ms = retry_at_ms;
        events.push(ConnectivityEvent::SetupModeEntered { retry_at_ms });
    }

    fn ensure_access_point(
        &mut self,
        station: &mut impl StationLink,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        if self.access_point_active {
            return;
        }

        match station.start_access_point(&self.settings.access_point) {
            Ok(()) => {
                self.access_point_active = true;
                events.push(ConnectivityEvent::AccessPointStarted {
                    ssid: self.settings.access_point.ssid.clone(),
                });
            }
            Err(err) => events.push(ConnectivityEvent::AccessPointFailed(err)),
        }
    }
}
