use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::EspWifi,
};
use log::{debug, info, warn};

use relay_common::{
    config::BrokerConfig, AccessPointConfig, BrokerError, BrokerLink, Controller,
    ControllerConfig, ControllerEvent, EventLevel, HardwareIdentity, KeyValueStore, LinkError,
    PersistError, ProvisioningReply, ProvisioningRequest, Publisher, RelayDriver, StationLink,
    TickOutcome, SETUP_PAGE_PATHS,
};

const SETUP_PAGE: &str = include_str!("../web/setup.html");
const MAX_HTTP_BODY: usize = 4096;
const MAX_NVS_STRING: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const TICK_MS: u64 = 50;
const PORTAL_QUEUE_DEPTH: usize = 4;
const PORTAL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_INPUT_ONLY_GPIO: i32 = 34;

struct PortalCall {
    request: ProvisioningRequest,
    reply: mpsc::Sender<ProvisioningReply>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut config = ControllerConfig::default();
    apply_build_overrides(&mut config);
    config.sanitize();

    info!(
        "controller config: broker `{}:{}`, {} relays, nvs namespace `{}`",
        config.broker.host,
        config.broker.port,
        config.relay_count(),
        config.store_namespace,
    );

    let kv = NvsKvStore::open(nvs_partition.clone(), &config.store_namespace)
        .context("failed to open NVS namespace")?;
    let relays = GpioRelays::new(&config.relay_pins);
    let mut station =
        EspStation::new(modem, sys_loop, nvs_partition).context("wifi driver init failed")?;
    let mut broker = EspBroker::new(&config.broker, config.timing.broker_timeout_ms);

    let mut controller = Controller::new(config, &EfuseIdentity, relays, kv, SETUP_PAGE);
    for event in controller.boot(monotonic_ms(), &mut station) {
        log_event(&event);
    }

    let (calls_tx, calls_rx) = mpsc::sync_channel(PORTAL_QUEUE_DEPTH);
    let _server = create_portal_server(calls_tx)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register controller loop with watchdog: {err:#}");
    }

    loop {
        feed_watchdog();

        let report = controller.tick(monotonic_ms(), &mut station, &mut broker);
        report.events.iter().for_each(log_event);
        if report.outcome == TickOutcome::Restart {
            info!("restarting to apply new configuration");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }

        while let Ok(call) = calls_rx.try_recv() {
            let (reply, events) =
                controller.handle_request(call.request, &mut station, monotonic_ms());
            events.iter().for_each(log_event);
            if call.reply.send(reply).is_err() {
                debug!("http handler gave up before reply");
            }
        }

        thread::sleep(Duration::from_millis(TICK_MS));
    }
}

fn apply_build_overrides(config: &mut ControllerConfig) {
    if let Some(host) = option_env!("MQTT_HOST") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
}

fn log_event(event: &ControllerEvent) {
    match event.level() {
        EventLevel::Debug => debug!("{event}"),
        EventLevel::Info => info!("{event}"),
        EventLevel::Warn => warn!("{event}"),
    }
}

fn create_portal_server(
    calls: mpsc::SyncSender<PortalCall>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in SETUP_PAGE_PATHS {
        let calls = calls.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let reply = forward(&calls, ProvisioningRequest::SetupPage);
            write_reply(req, &reply)
        })?;
    }

    {
        let calls = calls.clone();
        server.fn_handler::<anyhow::Error, _>("/scan", Method::Get, move |req| {
            let reply = forward(&calls, ProvisioningRequest::Scan);
            write_reply(req, &reply)
        })?;
    }

    {
        let calls = calls.clone();
        server.fn_handler::<anyhow::Error, _>("/test", Method::Get, move |req| {
            let reply = forward(&calls, ProvisioningRequest::Test);
            write_reply(req, &reply)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/configure", Method::Post, move |mut req| {
        let reply = match read_request_body(&mut req) {
            Ok(body) => forward(&calls, ProvisioningRequest::Configure(body)),
            Err(err) => {
                warn!("rejecting configure request: {err:#}");
                ProvisioningReply::error(413, "request body too large")
            }
        };
        write_reply(req, &reply)
    })?;

    Ok(server)
}

/// Hands a portal request to the controller loop and waits for its answer.
fn forward(calls: &mpsc::SyncSender<PortalCall>, request: ProvisioningRequest) -> ProvisioningReply {
    let (reply_tx, reply_rx) = mpsc::channel();
    let call = PortalCall {
        request,
        reply: reply_tx,
    };

    if calls.send(call).is_err() {
        return ProvisioningReply::error(503, "controller loop stopped");
    }
    reply_rx
        .recv_timeout(PORTAL_REPLY_TIMEOUT)
        .unwrap_or_else(|_| ProvisioningReply::error(503, "controller loop busy"))
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body of {len} bytes exceeds {MAX_HTTP_BODY}"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: &ProvisioningReply,
) -> anyhow::Result<()> {
    req.into_response(reply.status, None, &[("Content-Type", reply.content_type)])?
        .write_all(&reply.body)?;
    Ok(())
}

/// eFuse base MAC packed little-endian, matching how the id has always
/// been derived on deployed units.
struct EfuseIdentity;

impl HardwareIdentity for EfuseIdentity {
    fn hardware_id(&self) -> u64 {
        let mut mac = [0_u8; 6];
        let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("esp_efuse_mac_get_default failed with code {rc}");
        }

        let mut raw = [0_u8; 8];
        raw[..6].copy_from_slice(&mac);
        u64::from_le_bytes(raw)
    }
}

/// Relay outputs on GPIO. Pins that cannot drive an output are skipped;
/// the logical channel still tracks state.
struct GpioRelays {
    outputs: Vec<Option<PinDriver<'static, AnyOutputPin, Output>>>,
}

impl GpioRelays {
    fn new(pins: &[i32]) -> Self {
        let outputs = pins
            .iter()
            .map(|&pin| {
                if pin >= FIRST_INPUT_ONLY_GPIO {
                    warn!("GPIO{pin} is input-only; relay output disabled");
                    return None;
                }
                match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
                    Ok(driver) => Some(driver),
                    Err(err) => {
                        warn!("GPIO{pin} unavailable for relay output: {err}");
                        None
                    }
                }
            })
            .collect();

        Self { outputs }
    }
}

impl RelayDriver for GpioRelays {
    fn set_level(&mut self, channel: usize, pin: i32, on: bool) {
        let Some(Some(output)) = self.outputs.get_mut(channel) else {
            return;
        };

        let result = if on {
            output.set_high()
        } else {
            output.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay {channel} on GPIO{pin}: {err}");
        }
    }
}

struct NvsKvStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsKvStore {
    fn open(partition: EspDefaultNvsPartition, namespace: &str) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, namespace, true)?,
        })
    }
}

impl KeyValueStore for NvsKvStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, PersistError> {
        let mut buffer = vec![0_u8; MAX_NVS_STRING];
        self.nvs
            .get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| PersistError::Read {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), PersistError> {
        self.nvs
            .set_str(key, value)
            .map_err(|err| PersistError::Write {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PersistError> {
        self.nvs
            .get_u8(key)
            .map(|value| value.map(|raw| raw != 0))
            .map_err(|err| PersistError::Read {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PersistError> {
        self.nvs
            .set_u8(key, u8::from(value))
            .map_err(|err| PersistError::Write {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Non-blocking wrapper over `EspWifi`. Once the setup access point is up
/// the radio stays in mixed mode so scans and station retries keep working.
struct EspStation {
    wifi: EspWifi<'static>,
    client: Option<ClientConfiguration>,
    access_point: Option<AccessPointConfiguration>,
}

impl EspStation {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            wifi: EspWifi::new(modem, sys_loop, Some(nvs_partition))?,
            client: None,
            access_point: None,
        })
    }

    fn apply(&mut self) -> Result<(), LinkError> {
        let configuration = match (&self.client, &self.access_point) {
            (client, Some(access_point)) => {
                Configuration::Mixed(client.clone().unwrap_or_default(), access_point.clone())
            }
            (Some(client), None) => Configuration::Client(client.clone()),
            (None, None) => return Ok(()),
        };

        self.wifi
            .set_configuration(&configuration)
            .map_err(driver_error)?;

        if !self.wifi.is_started().map_err(driver_error)? {
            self.wifi.start().map_err(driver_error)?;
            disable_wifi_power_save();
        }
        Ok(())
    }
}

fn driver_error(err: impl core::fmt::Display) -> LinkError {
    LinkError::Driver(err.to_string())
}

impl StationLink for EspStation {
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.client = Some(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| LinkError::Driver("wifi ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| LinkError::Driver("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        let _ = self.wifi.disconnect();
        self.apply()?;
        self.wifi.connect().map_err(driver_error)
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn start_access_point(&mut self, access_point: &AccessPointConfig) -> Result<(), LinkError> {
        self.access_point = Some(AccessPointConfiguration {
            ssid: access_point
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Driver("access point ssid too long".to_string()))?,
            password: access_point
                .password
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Driver("access point password too long".to_string()))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: 1,
            ..Default::default()
        });

        self.apply()?;
        if self.client.is_some() {
            if let Err(err) = self.wifi.connect() {
                debug!("station reconnect after access point start: {err}");
            }
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, LinkError> {
        let mut networks: Vec<String> = self
            .wifi
            .scan()
            .map_err(driver_error)?
            .into_iter()
            .map(|info| info.ssid.to_string())
            .filter(|ssid| !ssid.is_empty())
            .collect();
        networks.dedup();
        Ok(networks)
    }

    fn ip_address(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }

    fn rssi(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(ap_info.rssi))
    }
}

/// ESP-IDF MQTT client. The IDF client reconnects on its own; `connect`
/// only recreates it when no CONNACK arrived within the timeout.
struct EspBroker {
    url: String,
    timeout: Duration,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    started: Instant,
}

impl EspBroker {
    fn new(config: &BrokerConfig, timeout_ms: u64) -> Self {
        Self {
            url: format!("mqtt://{}:{}", config.host, config.port),
            timeout: Duration::from_millis(timeout_ms),
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound: None,
            started: Instant::now(),
        }
    }

    fn open(&mut self, client_id: &str) -> Result<(), BrokerError> {
        self.client = None;
        self.inbound = None;

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            network_timeout: self.timeout,
            ..Default::default()
        };
        let (client, connection) = EspMqttClient::new(self.url.as_str(), &conf)
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let connected = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound) = mpsc::channel();
        spawn_mqtt_receiver(connection, connected.clone(), inbound_tx)
            .map_err(|err| BrokerError::Connect(format!("receiver thread: {err}")))?;

        self.client = Some(client);
        self.connected = connected;
        self.inbound = Some(inbound);
        self.started = Instant::now();
        Ok(())
    }

    fn connected_client(&mut self) -> Result<&mut EspMqttClient<'static>, BrokerError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(BrokerError::NotConnected);
        }
        self.client.as_mut().ok_or(BrokerError::NotConnected)
    }
}

fn spawn_mqtt_receiver(
    mut connection: EspMqttConnection,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = connection.next() {
                match event.payload() {
                    EventPayload::Connected(_) => connected.store(true, Ordering::Relaxed),
                    EventPayload::Disconnected => connected.store(false, Ordering::Relaxed),
                    EventPayload::Received { data, details, .. } => {
                        if !matches!(details, Details::Complete) {
                            warn!("dropping fragmented MQTT payload ({} bytes)", data.len());
                            continue;
                        }
                        if inbound.send(data.to_vec()).is_err() {
                            break;
                        }
                    }
                    EventPayload::Error(err) => warn!("mqtt client error: {err:?}"),
                    _ => {}
                }
            }
            connected.store(false, Ordering::Relaxed);
            debug!("mqtt receiver stopped");
        })?;
    Ok(())
}

impl Publisher for EspBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.connected_client()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| BrokerError::Publish(err.to_string()))
    }
}

impl BrokerLink for EspBroker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
        if self.client.is_some() {
            if self.connected.load(Ordering::Relaxed) {
                return Ok(());
            }
            if self.started.elapsed() < self.timeout {
                return Err(BrokerError::HandshakePending);
            }
        }

        let timed_out = self.client.is_some();
        self.open(client_id)?;
        if timed_out {
            return Err(BrokerError::Connect(format!(
                "no CONNACK from {} within {:?}; reconnecting",
                self.url, self.timeout
            )));
        }
        Err(BrokerError::HandshakePending)
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.connected_client()
            .map_err(|_| BrokerError::Subscribe("not connected".to_string()))?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| BrokerError::Subscribe(err.to_string()))
    }

    fn poll_inbound(&mut self) -> Vec<Vec<u8>> {
        self.inbound
            .as_ref()
            .map(|inbound| inbound.try_iter().collect())
            .unwrap_or_default()
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
