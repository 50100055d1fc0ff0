use std::fmt;

use crate::{
    command::{CommandOutcome, CommandProcessor, CommandReport, StatusEcho},
    config::ControllerConfig,
    connectivity::{
        BrokerError, BrokerLink, ConnectivityEvent, ConnectivityState, ConnectivitySupervisor,
        StationLink, SupervisorSettings,
    },
    identity::{DeviceId, HardwareIdentity},
    provisioning::{
        ProvisioningEvent, ProvisioningReply, ProvisioningRequest, ProvisioningService,
        RequestRestart,
    },
    relay::{RelayBank, RelayDriver},
    store::{CredentialStore, Credentials, KeyValueStore, PersistError},
    topics::{TOPIC_CREDENTIALS, TOPIC_DEVICE_STATUS},
    types::{CredentialsPayload, DeviceStatusPayload},
};

const UNASSIGNED_IP: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Booted {
        device_id: String,
        configured: bool,
        relays: usize,
    },
    StoreReadFailed(PersistError),
    Connectivity(ConnectivityEvent),
    Command(CommandReport),
    Provisioning(ProvisioningEvent),
    PortalClosed,
    RelayExpired {
        relay: usize,
        status: StatusEcho,
    },
    DeviceStatusPublished,
    DeviceStatusFailed(BrokerError),
    CredentialsPublished,
    CredentialsFailed(BrokerError),
    RestartDue(RequestRestart),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub events: Vec<ControllerEvent>,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

impl ControllerEvent {
    /// Failures are `Warn`, state changes are `Info`, per-tick chatter is
    /// `Debug`.
    pub fn level(&self) -> EventLevel {
        match self {
            Self::StoreReadFailed(_)
            | Self::DeviceStatusFailed(_)
            | Self::CredentialsFailed(_)
            | Self::PortalClosed => EventLevel::Warn,
            Self::Connectivity(event) => match event {
                ConnectivityEvent::AssociationAttempt { .. }
                | ConnectivityEvent::BrokerConnectFailed(BrokerError::HandshakePending) => {
                    EventLevel::Debug
                }
                ConnectivityEvent::AccessPointFailed(_)
                | ConnectivityEvent::AssociationFailed(_)
                | ConnectivityEvent::AssociationExhausted { .. }
                | ConnectivityEvent::StationLost
                | ConnectivityEvent::BrokerConnectFailed(_)
                | ConnectivityEvent::BrokerLost => EventLevel::Warn,
                _ => EventLevel::Info,
            },
            Self::Command(report) => match (&report.outcome, &report.status) {
                (_, StatusEcho::Failed(_)) => EventLevel::Warn,
                (CommandOutcome::IgnoredForeignDevice { .. }, _)
                | (CommandOutcome::UnknownAction { .. }, _) => EventLevel::Debug,
                (CommandOutcome::Applied { .. }, _) => EventLevel::Info,
                _ => EventLevel::Warn,
            },
            Self::Provisioning(event) => match event {
                ProvisioningEvent::ScanFailed(_)
                | ProvisioningEvent::ConfigureBodyMalformed(_)
                | ProvisioningEvent::ConfigurationFailed(_) => EventLevel::Warn,
                ProvisioningEvent::SetupPageServed | ProvisioningEvent::LivenessProbed => {
                    EventLevel::Debug
                }
                _ => EventLevel::Info,
            },
            Self::RelayExpired {
                status: StatusEcho::Failed(_),
                ..
            } => EventLevel::Warn,
            Self::DeviceStatusPublished => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Booted {
                device_id,
                configured,
                relays,
            } => write!(
                f,
                "device {device_id} booted with {relays} relays (configured={configured})"
            ),
            Self::StoreReadFailed(err) => write!(f, "persistent store read failed: {err}"),
            Self::Connectivity(event) => fmt_connectivity(event, f),
            Self::Command(report) => fmt_command(report, f),
            Self::Provisioning(event) => fmt_provisioning(event, f),
            Self::PortalClosed => f.write_str("provisioning request refused: access point is down"),
            Self::RelayExpired { relay, status } => {
                write!(f, "relay {relay} timer expired")?;
                if let StatusEcho::Failed(err) = status {
                    write!(f, "; status publish failed: {err}")?;
                }
                Ok(())
            }
            Self::DeviceStatusPublished => f.write_str("device status published"),
            Self::DeviceStatusFailed(err) => write!(f, "device status publish failed: {err}"),
            Self::CredentialsPublished => f.write_str("account credentials published"),
            Self::CredentialsFailed(err) => write!(f, "credentials publish failed: {err}"),
            Self::RestartDue(restart) => {
                write!(f, "restart requested (due at {} ms)", restart.due_ms)
            }
        }
    }
}

fn fmt_connectivity(event: &ConnectivityEvent, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match event {
        ConnectivityEvent::AccessPointStarted { ssid } => {
            write!(f, "setup access point `{ssid}` started")
        }
        ConnectivityEvent::AccessPointFailed(err) => {
            write!(f, "setup access point failed to start: {err}")
        }
        ConnectivityEvent::SetupModeEntered { retry_at_ms: None } => {
            f.write_str("entered setup mode; waiting for configuration")
        }
        ConnectivityEvent::SetupModeEntered {
            retry_at_ms: Some(at),
        } => write!(f, "entered setup mode; station retry at {at} ms"),
        ConnectivityEvent::AssociationStarted { ssid } => {
            write!(f, "associating with `{ssid}`")
        }
        ConnectivityEvent::AssociationFailed(err) => write!(f, "wifi association failed: {err}"),
        ConnectivityEvent::AssociationAttempt { attempt, max } => {
            write!(f, "wifi probe {attempt}/{max}")
        }
        ConnectivityEvent::AssociationExhausted { attempts } => {
            write!(f, "wifi not connected after {attempts} attempts")
        }
        ConnectivityEvent::StationConnected { ip } => write!(
            f,
            "wifi connected, ip {}",
            ip.as_deref().unwrap_or(UNASSIGNED_IP)
        ),
        ConnectivityEvent::StationLost => f.write_str("wifi station link lost"),
        ConnectivityEvent::BrokerConnected => {
            f.write_str("broker connected and subscribed to control topic")
        }
        ConnectivityEvent::BrokerConnectFailed(err) => write!(f, "{err}"),
        ConnectivityEvent::BrokerLost => f.write_str("broker connection lost"),
    }
}

fn fmt_command(report: &CommandReport, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &report.outcome {
        CommandOutcome::Applied {
            relay,
            action,
            state,
        } => write!(
            f,
            "relay {relay} {} -> {}",
            action.as_str(),
            if *state { "on" } else { "off" }
        )?,
        CommandOutcome::Rejected { action, error } => {
            write!(f, "rejected {} command: {error}", action.as_str())?
        }
        CommandOutcome::UnknownAction { relay } => {
            write!(f, "unknown action for relay {relay}; state unchanged")?
        }
        CommandOutcome::IgnoredForeignDevice { target } => {
            write!(f, "ignoring command for device `{target}`")?
        }
        CommandOutcome::Dropped(err) => write!(f, "dropped control message: {err}")?,
    }

    if let StatusEcho::Failed(err) = &report.status {
        write!(f, "; status publish failed: {err}")?;
    }
    Ok(())
}

fn fmt_provisioning(event: &ProvisioningEvent, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match event {
        ProvisioningEvent::SetupPageServed => f.write_str("setup page served"),
        ProvisioningEvent::LivenessProbed => f.write_str("liveness probe"),
        ProvisioningEvent::ScanCompleted { networks } => {
            write!(f, "wifi scan found {networks} networks")
        }
        ProvisioningEvent::ScanFailed(err) => write!(f, "wifi scan failed: {err}"),
        ProvisioningEvent::ConfigureBodyMalformed(reason) => write!(
            f,
            "configure body malformed ({reason}); saving empty fields"
        ),
        ProvisioningEvent::ConfigurationSaved {
            ssid,
            restart_at_ms,
        } => write!(
            f,
            "configuration saved for `{ssid}`; restart at {restart_at_ms} ms"
        ),
        ProvisioningEvent::ConfigurationFailed(err) => {
            write!(f, "configuration not saved: {err}")
        }
    }
}

/// Single owner of all mutable device state. The host and ESP runtimes call
/// `boot` once and then `tick` on a fixed cadence; portal requests are
/// forwarded into `handle_request` from the same loop, so nothing here is
/// shared across threads.
pub struct Controller<D, K> {
    config: ControllerConfig,
    device_id: DeviceId,
    relays: RelayBank<D>,
    store: CredentialStore<K>,
    supervisor: ConnectivitySupervisor,
    processor: CommandProcessor,
    provisioning: ProvisioningService,
    configured: bool,
    credentials: Credentials,
    boot_ms: u64,
    last_device_status_ms: u64,
    last_credentials_check_ms: u64,
    credentials_sent: bool,
    credentials_checked_after_connect: bool,
}

impl<D: RelayDriver, K: KeyValueStore> Controller<D, K> {
    pub fn new(
        mut config: ControllerConfig,
        identity: &impl HardwareIdentity,
        driver: D,
        kv: K,
        setup_page: &'static str,
    ) -> Self {
        config.sanitize();

        let device_id = DeviceId::generate(identity);
        let relays = RelayBank::new(driver, &config.relay_pins);
        let supervisor = ConnectivitySupervisor::new(
            SupervisorSettings::from_config(&config),
            device_id.as_str(),
        );
        let processor = CommandProcessor::new(device_id.clone(), config.broker.max_payload_bytes);
        let provisioning = ProvisioningService::new(setup_page, config.timing.restart_delay_ms);

        Self {
            config,
            device_id,
            relays,
            store: CredentialStore::new(kv),
            supervisor,
            processor,
            provisioning,
            configured: false,
            credentials: Credentials::default(),
            boot_ms: 0,
            last_device_status_ms: 0,
            last_credentials_check_ms: 0,
            credentials_sent: false,
            credentials_checked_after_connect: false,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn relays(&self) -> &RelayBank<D> {
        &self.relays
    }

    pub fn store(&self) -> &CredentialStore<K> {
        &self.store
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.supervisor.state()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn credentials_sent(&self) -> bool {
        self.credentials_sent
    }

    pub fn pending_restart(&self) -> Option<RequestRestart> {
        self.provisioning.pending_restart()
    }

    /// The portal answers while the device is unconfigured or the setup
    /// access point is up.
    pub fn portal_open(&self) -> bool {
        !self.configured || self.supervisor.access_point_active()
    }

    /// Reads persisted state and picks the top-level mode.
    pub fn boot(&mut self, now_ms: u64, station: &mut impl StationLink) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        self.configured = self.store.is_configured().unwrap_or_else(|err| {
            events.push(ControllerEvent::StoreReadFailed(err));
            false
        });
        self.credentials = self.store.load().unwrap_or_else(|err| {
            events.push(ControllerEvent::StoreReadFailed(err));
            Credentials::default()
        });

        self.boot_ms = now_ms;
        self.last_device_status_ms = now_ms;
        self.last_credentials_check_ms = now_ms;
        self.credentials_sent = false;
        self.credentials_checked_after_connect = false;

        events.push(ControllerEvent::Booted {
            device_id: self.device_id.to_string(),
            configured: self.configured,
            relays: self.relays.len(),
        });

        let connectivity = self
            .supervisor
            .start(self.configured, &self.credentials, now_ms, station);
        events.extend(connectivity.into_iter().map(ControllerEvent::Connectivity));

        events
    }

    pub fn tick(
        &mut self,
        now_ms: u64,
        station: &mut impl StationLink,
        broker: &mut impl BrokerLink,
    ) -> TickReport {
        let mut events = Vec::new();

        if let Some(restart) = self.provisioning.take_due_restart(now_ms) {
            events.push(ControllerEvent::RestartDue(restart));
            return TickReport {
                events,
                outcome: TickOutcome::Restart,
            };
        }

        if self.configured {
            let connectivity = self.supervisor.tick(now_ms, station, broker);
            let broker_came_up = connectivity
                .iter()
                .any(|event| *event == ConnectivityEvent::BrokerConnected);
            events.extend(connectivity.into_iter().map(ControllerEvent::Connectivity));

            if broker_came_up && !self.credentials_checked_after_connect {
                self.credentials_checked_after_connect = true;
                self.send_credentials(now_ms, broker, &mut events);
            }

            self.supervisor.pump_inbound(broker, |raw, broker| {
                let report = self.processor.handle(raw, &mut self.relays, broker, now_ms);
                events.push(ControllerEvent::Command(report));
            });
        }

        for relay in self.relays.tick(now_ms) {
            let status = if self.supervisor.broker_connected() {
                self.processor
                    .publish_relay_status(relay as i64, &self.relays, broker, now_ms)
            } else {
                StatusEcho::NotSent
            };
            events.push(ControllerEvent::RelayExpired { relay, status });
        }

        if self.configured && self.supervisor.station_up() {
            self.run_periodic(now_ms, station, broker, &mut events);
        }

        TickReport {
            events,
            outcome: TickOutcome::Continue,
        }
    }

    pub fn handle_request(
        &mut self,
        request: ProvisioningRequest,
        station: &mut impl StationLink,
        now_ms: u64,
    ) -> (ProvisioningReply, Vec<ControllerEvent>) {
        if !self.portal_open() {
            return (
                ProvisioningReply::error(409, "setup portal is not active"),
                vec![ControllerEvent::PortalClosed],
            );
        }

        let (reply, provisioning) =
            self.provisioning
                .handle(request, &mut self.store, station, now_ms);

        let saved = provisioning
            .iter()
            .any(|event| matches!(event, ProvisioningEvent::ConfigurationSaved { .. }));
        if saved {
            if let Ok(credentials) = self.store.load() {
                self.credentials = credentials;
            }
            self.credentials_sent = false;
        }

        let events = provisioning
            .into_iter()
            .map(ControllerEvent::Provisioning)
            .collect();
        (reply, events)
    }

    pub fn device_status(&self, now_ms: u64, station: &impl StationLink) -> DeviceStatusPayload {
        DeviceStatusPayload {
            device_id: self.device_id.to_string(),
            ip: station
                .ip_address()
                .unwrap_or_else(|| UNASSIGNED_IP.to_string()),
            rssi: station.rssi().unwrap_or(0),
            uptime: now_ms.saturating_sub(self.boot_ms),
            timestamp: now_ms,
            relays: self.relays.snapshot(),
        }
    }

    fn run_periodic(
        &mut self,
        now_ms: u64,
        station: &impl StationLink,
        broker: &mut impl BrokerLink,
        events: &mut Vec<ControllerEvent>,
    ) {
        if self.supervisor.broker_connected()
            && now_ms.saturating_sub(self.last_device_status_ms)
                >= self.config.timing.device_status_interval_ms
        {
            self.last_device_status_ms = now_ms;
            let payload = self.device_status(now_ms, station);
            let result = serde_json::to_vec(&payload)
                .map_err(|err| BrokerError::Encode(err.to_string()))
                .and_then(|bytes| broker.publish(TOPIC_DEVICE_STATUS, &bytes));
            events.push(match result {
                Ok(()) => ControllerEvent::DeviceStatusPublished,
                Err(err) => ControllerEvent::DeviceStatusFailed(err),
            });
        }

        if !self.credentials_sent
            && now_ms.saturating_sub(self.last_credentials_check_ms)
                >= self.config.timing.credentials_retry_interval_ms
        {
            self.last_credentials_check_ms = now_ms;
            self.send_credentials(now_ms, broker, events);
        }
    }

    /// Publishes the account credentials once per boot (or per save). Nothing
    /// is sent when either account field is empty.
    fn send_credentials(
        &mut self,
        now_ms: u64,
        broker: &mut impl BrokerLink,
        events: &mut Vec<ControllerEvent>,
    ) {
        if self.credentials_sent || !self.credentials.has_account() {
            return;
        }
        if !self.supervisor.broker_connected() {
            events.push(ControllerEvent::CredentialsFailed(BrokerError::NotConnected));
            return;
        }

        let payload = CredentialsPayload {
            device_id: self.device_id.to_string(),
            username: self.credentials.account_username.clone(),
            password: self.credentials.account_password.clone(),
            timestamp: now_ms,
        };
        let result = serde_json::to_vec(&payload)
            .map_err(|err| BrokerError::Encode(err.to_string()))
            .and_then(|bytes| broker.publish(TOPIC_CREDENTIALS, &bytes));

        match result {
            Ok(()) => {
                self.credentials_sent = true;
                events.push(ControllerEvent::CredentialsPublished);
            }
            Err(err) => events.push(ControllerEvent::CredentialsFailed(err)),
        }
    }
}
