use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use relay_common::{
    config::BrokerConfig, types::ErrorBody, AccessPointConfig, BrokerError, BrokerLink,
    Controller, ControllerConfig, ControllerEvent, DeviceStatusPayload, EventLevel,
    KeyValueStore, LinkError, PersistError, ProvisioningReply, ProvisioningRequest, Publisher,
    RelayDriver, StaticIdentity, StationLink, TickOutcome, SETUP_PAGE_PATHS,
};

const SETUP_PAGE: &str = include_str!("../web/setup.html");
const CONFIG_FILE: &str = "controller.json";
const TICK_MS: u64 = 50;
const LOOP_QUEUE_DEPTH: usize = 16;
const DEFAULT_HTTP_PORT: u16 = 8080;
const HOST_HARDWARE_ID: u64 = 0x5eed_c0de;
const MQTT_KEEP_ALIVE_SECS: u64 = 15;
const MQTT_CHANNEL_CAPACITY: usize = 64;
const SIM_IP: &str = "127.0.0.1";
const SIM_RSSI: i32 = -55;

type HostController = Controller<LoggingRelays, FileStore>;

enum HostRequest {
    Portal(ProvisioningRequest),
    Status,
}

struct LoopCall {
    request: HostRequest,
    reply: oneshot::Sender<ProvisioningReply>,
}

/// Axum-side handle; every request is answered by the controller loop.
#[derive(Clone)]
struct LoopHandle {
    calls: mpsc::Sender<LoopCall>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    state: &'static str,
    configured: bool,
    #[serde(rename = "credentialsSent")]
    credentials_sent: bool,
    #[serde(flatten)]
    device: DeviceStatusPayload,
}

enum SessionEnd {
    Restart,
    Shutdown,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = data_dir();
    let mut config = load_config(&data_dir).await.unwrap_or_else(|err| {
        warn!("failed to load controller config: {err:#}");
        ControllerConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    info!(
        "controller config: broker `{}:{}`, {} relays, store `{}`",
        config.broker.host,
        config.broker.port,
        config.relay_count(),
        data_dir.join(format!("{}.json", config.store_namespace)).display(),
    );

    let (calls_tx, mut calls_rx) = mpsc::channel(LOOP_QUEUE_DEPTH);
    let app = build_router(LoopHandle { calls: calls_tx });

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind setup portal at {addr}"))?;

    info!("setup portal listening on http://{addr}");
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("http server stopped: {err}");
        }
    });

    loop {
        match run_session(&config, &data_dir, &mut calls_rx).await? {
            SessionEnd::Restart => info!("restarting controller session"),
            SessionEnd::Shutdown => break,
        }
    }

    server.abort();
    info!("controller stopped");
    Ok(())
}

/// One boot of the device: everything but the persisted store is rebuilt.
async fn run_session(
    config: &ControllerConfig,
    data_dir: &Path,
    calls: &mut mpsc::Receiver<LoopCall>,
) -> anyhow::Result<SessionEnd> {
    let store_path = data_dir.join(format!("{}.json", config.store_namespace));
    let kv = FileStore::open(store_path).context("failed to open credential store")?;

    let mut controller = Controller::new(
        config.clone(),
        &host_identity(),
        LoggingRelays,
        kv,
        SETUP_PAGE,
    );
    let mut station = SimStation::from_env();
    let mut broker = MqttBroker::new(&config.broker, config.timing.broker_timeout_ms);

    for event in controller.boot(monotonic_ms(), &mut station) {
        log_event(&event);
    }

    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = controller.tick(monotonic_ms(), &mut station, &mut broker);
                report.events.iter().for_each(log_event);
                if report.outcome == TickOutcome::Restart {
                    return Ok(SessionEnd::Restart);
                }
            }
            Some(call) = calls.recv() => {
                let reply = answer_call(&mut controller, &mut station, call.request);
                if call.reply.send(reply).is_err() {
                    debug!("http client went away before reply");
                }
            }
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

fn answer_call(
    controller: &mut HostController,
    station: &mut SimStation,
    request: HostRequest,
) -> ProvisioningReply {
    let now_ms = monotonic_ms();
    match request {
        HostRequest::Portal(request) => {
            let (reply, events) = controller.handle_request(request, station, now_ms);
            events.iter().for_each(log_event);
            reply
        }
        HostRequest::Status => {
            let view = StatusView {
                state: controller.connectivity_state().as_str(),
                configured: controller.is_configured(),
                credentials_sent: controller.credentials_sent(),
                device: controller.device_status(now_ms, station),
            };
            ProvisioningReply::json(200, &view)
        }
    }
}

fn build_router(handle: LoopHandle) -> Router {
    let mut router = Router::new()
        .route("/scan", get(handle_scan))
        .route("/configure", post(handle_configure))
        .route("/test", get(handle_test))
        .route("/api/status", get(handle_status));

    for path in SETUP_PAGE_PATHS {
        router = router.route(path, get(handle_setup_page));
    }

    router.with_state(handle)
}

async fn handle_setup_page(State(handle): State<LoopHandle>) -> Response {
    handle
        .call(HostRequest::Portal(ProvisioningRequest::SetupPage))
        .await
}

async fn handle_scan(State(handle): State<LoopHandle>) -> Response {
    handle.call(HostRequest::Portal(ProvisioningRequest::Scan)).await
}

async fn handle_configure(State(handle): State<LoopHandle>, body: Bytes) -> Response {
    handle
        .call(HostRequest::Portal(ProvisioningRequest::Configure(
            body.to_vec(),
        )))
        .await
}

async fn handle_test(State(handle): State<LoopHandle>) -> Response {
    handle.call(HostRequest::Portal(ProvisioningRequest::Test)).await
}

async fn handle_status(State(handle): State<LoopHandle>) -> Response {
    handle.call(HostRequest::Status).await
}

impl LoopHandle {
    async fn call(&self, request: HostRequest) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = LoopCall {
            request,
            reply: reply_tx,
        };

        if self.calls.send(call).await.is_err() {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "controller loop stopped");
        }

        match reply_rx.await {
            Ok(reply) => reply_response(reply),
            Err(_) => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "controller restarted before replying",
            ),
        }
    }
}

fn reply_response(reply: ProvisioningReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, reply.content_type)], reply.body).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn log_event(event: &ControllerEvent) {
    match event.level() {
        EventLevel::Debug => debug!("{event}"),
        EventLevel::Info => info!("{event}"),
        EventLevel::Warn => warn!("{event}"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("RELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relay-controller"))
}

async fn load_config(data_dir: &Path) -> anyhow::Result<ControllerConfig> {
    let path = data_dir.join(CONFIG_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid controller config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(ControllerConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: &mut ControllerConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.broker.port = port;
    }
}

fn host_identity() -> StaticIdentity {
    let raw = std::env::var("RELAY_HARDWARE_ID")
        .ok()
        .and_then(|value| parse_hardware_id(&value))
        .unwrap_or(HOST_HARDWARE_ID);
    StaticIdentity(raw)
}

fn parse_hardware_id(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
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

/// Relay outputs on the host are log lines.
struct LoggingRelays;

impl RelayDriver for LoggingRelays {
    fn set_level(&mut self, channel: usize, pin: i32, on: bool) {
        debug!(
            "relay {channel} (gpio {pin}) -> {}",
            if on { "HIGH" } else { "LOW" }
        );
    }
}

/// JSON-file key/value store standing in for NVS. One file per namespace,
/// rewritten on every set.
struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl FileStore {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt store file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    fn flush(&self, key: &str) -> Result<(), PersistError> {
        let write_error = |reason: String| PersistError::Write {
            key: key.to_string(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| write_error(err.to_string()))?;
        }
        let payload =
            serde_json::to_vec_pretty(&self.entries).map_err(|err| write_error(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|err| write_error(err.to_string()))
    }

    fn type_mismatch(key: &str, expected: &str) -> PersistError {
        PersistError::Read {
            key: key.to_string(),
            reason: format!("stored value is not a {expected}"),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, PersistError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(Self::type_mismatch(key, "string")),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), PersistError> {
        self.entries
            .insert(key.to_string(), Value::String(value.to_string()));
        self.flush(key)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PersistError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(Self::type_mismatch(key, "bool")),
        }
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PersistError> {
        self.entries.insert(key.to_string(), Value::Bool(value));
        self.flush(key)
    }
}

/// Simulated radio. Association succeeds only for SSIDs listed in
/// `RELAY_SIM_NETWORKS` while `RELAY_SIM_WIFI` is not `down`.
struct SimStation {
    reachable: bool,
    networks: Vec<String>,
    associated: Option<String>,
}

impl SimStation {
    fn from_env() -> Self {
        let reachable = std::env::var("RELAY_SIM_WIFI")
            .map(|value| !value.eq_ignore_ascii_case("down"))
            .unwrap_or(true);
        let networks = std::env::var("RELAY_SIM_NETWORKS")
            .unwrap_or_else(|_| "green-tech-lab".to_string())
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            reachable,
            networks,
            associated: None,
        }
    }
}

impl StationLink for SimStation {
    fn begin(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        let visible = self.networks.iter().any(|network| network == ssid);
        self.associated = (self.reachable && visible).then(|| ssid.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.associated.is_some()
    }

    fn start_access_point(&mut self, access_point: &AccessPointConfig) -> Result<(), LinkError> {
        debug!("simulated access point `{}` up", access_point.ssid);
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, LinkError> {
        if !self.reachable {
            return Ok(Vec::new());
        }
        Ok(self.networks.clone())
    }

    fn ip_address(&self) -> Option<String> {
        self.associated.as_ref().map(|_| SIM_IP.to_string())
    }

    fn rssi(&self) -> Option<i32> {
        self.associated.as_ref().map(|_| SIM_RSSI)
    }
}

/// rumqttc session driven by a background poll task. `connect` never waits:
/// it reports pending until CONNACK arrives and recycles the session once
/// the handshake has taken longer than the configured timeout.
struct MqttBroker {
    host: String,
    port: u16,
    timeout: Duration,
    session: Option<MqttSession>,
}

struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    poller: JoinHandle<()>,
    started: Instant,
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl MqttSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl MqttBroker {
    fn new(config: &BrokerConfig, timeout_ms: u64) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(timeout_ms),
            session: None,
        }
    }

    fn open_session(&self, client_id: &str) -> MqttSession {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SECS));

        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let poller = spawn_mqtt_loop(eventloop, connected.clone(), inbound_tx);

        MqttSession {
            client,
            connected,
            inbound,
            poller,
            started: Instant::now(),
        }
    }

    fn connected_session(&self) -> Result<&MqttSession, BrokerError> {
        self.session
            .as_ref()
            .filter(|session| session.is_connected())
            .ok_or(BrokerError::NotConnected)
    }
}

fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if inbound.send(message.payload.to_vec()).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::Relaxed);
                    debug!("mqtt CONNACK received");
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

impl Publisher for MqttBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.connected_session()?
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| BrokerError::Publish(err.to_string()))
    }
}

impl BrokerLink for MqttBroker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
        match &self.session {
            Some(session) if session.is_connected() => return Ok(()),
            Some(session) if session.started.elapsed() < self.timeout => {
                return Err(BrokerError::HandshakePending);
            }
            _ => {}
        }

        let timed_out = self.session.take().is_some();
        self.session = Some(self.open_session(client_id));

        if timed_out {
            return Err(BrokerError::Connect(format!(
                "no CONNACK from {}:{} within {:?}; reconnecting",
                self.host, self.port, self.timeout
            )));
        }
        Err(BrokerError::HandshakePending)
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.is_connected())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.connected_session()
            .map_err(|_| BrokerError::Subscribe("not connected".to_string()))?
            .client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| BrokerError::Subscribe(err.to_string()))
    }

    fn poll_inbound(&mut self) -> Vec<Vec<u8>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        while let Ok(message) = session.inbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}
