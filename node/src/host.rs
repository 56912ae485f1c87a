use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{rejection::FormRejection, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use hsc_common::{
    api::{self, ApiReply, ApiResponse},
    runtime::RESET_BUTTON_PIN,
    status::FIRMWARE_VERSION,
    BrokerClient, BrokerError, DeviceHandle, DigitalIo, FileConfigStore, JoinStatus, Level,
    NetworkError, NetworkPort, Runtime, SystemPort,
};

const DEFAULT_DATA_DIR: &str = "./.hsc";
const DEFAULT_HTTP_PORT: u16 = 8080;
const LOOP_IDLE_MS: u64 = 10;
const SIM_JOIN_DELAY: Duration = Duration::from_millis(1_200);
const SIM_RSSI_DBM: i8 = -55;
const SIM_MAC: [u8; 6] = [0x02, 0x48, 0x53, 0x43, 0x00, 0x01];
const SIM_FALLBACK_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct AppState {
    device: DeviceHandle,
    button: Arc<AtomicBool>,
    web_root: Arc<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct StateParam {
    state: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting hsc-node {FIRMWARE_VERSION} (host simulation)");

    let data_dir = PathBuf::from(
        std::env::var("HSC_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
    );
    let store = Arc::new(FileConfigStore::new(data_dir.join("config.json")));
    info!("config store at {}", store.path().display());

    let device = DeviceHandle::boot(store);
    let config = device.config();

    let button = Arc::new(AtomicBool::new(false));
    let time_synced = Arc::new(AtomicBool::new(false));

    let network = SimNetwork::new(env_flag("HSC_SIMULATE_OFFLINE"), time_synced.clone());
    let broker = HostBroker::new(Handle::current(), config.mqtt_server, config.mqtt_port);
    let io = SimIo::new(button.clone());
    let system = HostSystem::new(time_synced);

    spawn_device_loop(Runtime::new(device.clone(), network, broker, io, system))?;

    let web_root = std::env::var("HSC_WEB_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR"))));

    let app_state = AppState {
        device,
        button,
        web_root: Arc::new(web_root.clone()),
    };

    let app = Router::new()
        .route("/", get(handle_index))
        .route(
            "/api/settings",
            get(handle_get_settings).post(handle_post_settings),
        )
        .route("/api/reset", post(handle_reset))
        .route("/api/locate", post(handle_locate))
        .route("/api/restart", post(handle_restart))
        .route("/api/status", get(handle_get_status))
        .route("/api/sim/button", post(handle_sim_button))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("HSC_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind device server at {addr}"))?;

    info!("device page on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_device_loop(
    mut runtime: Runtime<SimNetwork, HostBroker, SimIo, HostSystem>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("device-loop".into())
        .spawn(move || {
            runtime.run(LOOP_IDLE_MS);
            // Nothing to reboot on a desktop; exit and let the supervisor
            // start a fresh process.
            info!("restart requested; exiting");
            std::process::exit(0);
        })
        .context("failed to spawn device loop")?;
    Ok(())
}

async fn handle_index(State(state): State<AppState>) -> Response {
    let path = state.web_root.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(api::render_index(&state.device, &page)).into_response(),
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            error_response(StatusCode::NOT_FOUND, "index.html not found")
        }
    }
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(api::settings(&state.device))
}

async fn handle_post_settings(State(state): State<AppState>, body: Bytes) -> Response {
    let device = state.device.clone();
    match tokio::task::spawn_blocking(move || api::save_settings(&device, &body)).await {
        Ok(response) => reply(response),
        Err(err) => {
            warn!("settings save task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save settings")
        }
    }
}

async fn handle_reset(State(state): State<AppState>) -> Response {
    let device = state.device.clone();
    match tokio::task::spawn_blocking(move || api::reset_settings(&device)).await {
        Ok(response) => reply(response),
        Err(err) => {
            warn!("settings reset task failed: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to reset settings",
            )
        }
    }
}

async fn handle_locate(
    State(state): State<AppState>,
    Query(query): Query<StateParam>,
    form: Result<Form<StateParam>, FormRejection>,
) -> Response {
    let form = form.ok().and_then(|Form(param)| param.state);
    reply(api::set_locate(
        &state.device,
        form.as_deref(),
        query.state.as_deref(),
    ))
}

async fn handle_restart(State(state): State<AppState>) -> Response {
    reply(api::restart(&state.device))
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.status())
}

/// `state=1` holds the simulated reset button down, `state=0` releases it.
async fn handle_sim_button(
    State(state): State<AppState>,
    Query(query): Query<StateParam>,
    form: Result<Form<StateParam>, FormRejection>,
) -> Response {
    let value = form
        .ok()
        .and_then(|Form(param)| param.state)
        .or(query.state);
    let Some(value) = value else {
        return error_response(StatusCode::BAD_REQUEST, "Missing state param");
    };

    let pressed = api::parse_flag(&value);
    info!("simulated reset button {}", if pressed { "pressed" } else { "released" });
    state.button.store(pressed, Ordering::Relaxed);
    Json(ApiReply::ok()).into_response()
}

fn reply(response: ApiResponse) -> Response {
    let status = StatusCode::from_u16(response.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.reply)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiReply::error(message))).into_response()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| api::parse_flag(value.trim()))
        .unwrap_or(false)
}

/// Station link that "joins" after a short delay, or never when running
/// offline so the fallback path can be exercised.
struct SimNetwork {
    offline: bool,
    join_started: Option<Instant>,
    fallback_up: bool,
    time_synced: Arc<AtomicBool>,
}

impl SimNetwork {
    fn new(offline: bool, time_synced: Arc<AtomicBool>) -> Self {
        if offline {
            info!("simulating an unreachable wifi network");
        }
        Self {
            offline,
            join_started: None,
            fallback_up: false,
            time_synced,
        }
    }

    fn joined(&self) -> bool {
        !self.offline
            && self
                .join_started
                .is_some_and(|started| started.elapsed() >= SIM_JOIN_DELAY)
    }
}

impl NetworkPort for SimNetwork {
    fn begin_join(&mut self, ssid: &str, _passphrase: &str) -> Result<(), NetworkError> {
        debug!("simulated join of `{ssid}`");
        self.join_started = Some(Instant::now());
        Ok(())
    }

    fn status(&mut self) -> JoinStatus {
        match self.join_started {
            None => JoinStatus::Failed,
            Some(_) if self.joined() => JoinStatus::Joined,
            Some(_) => JoinStatus::Joining,
        }
    }

    fn start_fallback_advertise(
        &mut self,
        ssid: &str,
        _passphrase: &str,
    ) -> Result<(), NetworkError> {
        info!("simulated fallback AP `{ssid}`; settings stay reachable over HTTP");
        self.fallback_up = true;
        Ok(())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.joined()
            .then(|| outbound_ipv4().unwrap_or(Ipv4Addr::LOCALHOST))
    }

    fn fallback_address(&self) -> Option<Ipv4Addr> {
        self.fallback_up.then_some(SIM_FALLBACK_ADDRESS)
    }

    fn rssi_dbm(&self) -> Option<i8> {
        self.joined().then_some(SIM_RSSI_DBM)
    }

    fn mac_address(&self) -> [u8; 6] {
        SIM_MAC
    }

    fn start_time_sync(&mut self) -> Result<(), NetworkError> {
        // The host clock is already disciplined by the OS.
        self.time_synced.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Address of the interface that would route to the internet. Connecting a
/// UDP socket sends nothing.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

struct SimIo {
    button: Arc<AtomicBool>,
    led: Level,
}

impl SimIo {
    fn new(button: Arc<AtomicBool>) -> Self {
        Self {
            button,
            led: Level::Low,
        }
    }
}

impl DigitalIo for SimIo {
    fn read(&mut self, pin: u8) -> Level {
        if pin == RESET_BUTTON_PIN && self.button.load(Ordering::Relaxed) {
            Level::Low
        } else {
            Level::High
        }
    }

    fn write(&mut self, pin: u8, level: Level) {
        if self.led != level {
            debug!("gpio{pin} -> {level:?}");
        }
        self.led = level;
    }
}

struct HostSystem {
    started: Instant,
    time_synced: Arc<AtomicBool>,
}

impl HostSystem {
    fn new(time_synced: Arc<AtomicBool>) -> Self {
        Self {
            started: Instant::now(),
            time_synced,
        }
    }
}

impl SystemPort for HostSystem {
    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn free_heap_bytes(&self) -> Option<u32> {
        None
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        self.time_synced
            .load(Ordering::Relaxed)
            .then(Utc::now)
    }
}

#[derive(Debug, PartialEq)]
enum LinkEvent {
    Up,
    Refused(i32),
    Down(String),
}

impl LinkEvent {
    fn from_error(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => Self::Refused(*code as i32),
            other => Self::Down(other.to_string()),
        }
    }
}

/// Blocking broker client over rumqttc's async client.
///
/// The event loop runs on the tokio runtime; the device loop thread waits on
/// a channel for the connection outcome.
struct HostBroker {
    runtime: Handle,
    host: String,
    port: u16,
    client: Option<AsyncClient>,
    events: Option<Receiver<LinkEvent>>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl HostBroker {
    fn new(runtime: Handle, host: String, port: u16) -> Self {
        Self {
            runtime,
            host,
            port,
            client: None,
            events: None,
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl BrokerClient for HostBroker {
    fn connect(&mut self, client_id: &str, user: &str, password: &str) -> Result<(), BrokerError> {
        self.shutdown();

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !user.is_empty() {
            options.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let (tx, rx) = mpsc::channel();
        self.task = Some(
            self.runtime
                .spawn(drive_eventloop(eventloop, self.connected.clone(), tx)),
        );

        match rx.recv_timeout(MQTT_CONNECT_TIMEOUT) {
            Ok(LinkEvent::Up) => {
                self.client = Some(client);
                self.events = Some(rx);
                Ok(())
            }
            Ok(LinkEvent::Refused(code)) => {
                self.shutdown();
                Err(BrokerError::Refused(code))
            }
            Ok(LinkEvent::Down(reason)) => {
                self.shutdown();
                Err(BrokerError::Transport(reason))
            }
            Err(_) => {
                self.shutdown();
                Err(BrokerError::Timeout)
            }
        }
    }

    fn connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, retained, payload.to_vec())
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn poll(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Up => {}
                LinkEvent::Refused(code) => warn!("mqtt connection refused (rc={code})"),
                LinkEvent::Down(reason) => warn!("mqtt link down: {reason}"),
            }
        }
    }
}

impl Drop for HostBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    events: Sender<LinkEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                let _ = events.send(LinkEvent::Up);
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                debug!("ignoring inbound publish on {}", message.topic);
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, Ordering::Relaxed);
                let _ = events.send(LinkEvent::from_error(&err));
                return;
            }
        }
    }
}
