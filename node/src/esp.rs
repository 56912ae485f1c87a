use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Gpio2, Gpio4, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf},
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use hsc_common::{
    api::{self, ApiReply, ApiResponse},
    network::assign_time_servers,
    runtime::{LED_PIN, RESET_BUTTON_PIN},
    status::FIRMWARE_VERSION,
    store::{decode_record, encode_record, MAX_RECORD_BYTES},
    topics::hostname_from_mac,
    BrokerClient, BrokerError, ConfigStore, DeviceConfig, DeviceHandle, DigitalIo, JoinStatus,
    Level, NetworkError, NetworkPort, Runtime, StoreError, SystemPort,
};

const NVS_NAMESPACE: &str = "hsc";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_READ_BUFFER: usize = MAX_RECORD_BYTES + 1;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_IDLE_MS: u64 = 10;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Anything earlier means SNTP has not set the clock yet (2020-01-01).
const CLOCK_VALID_AFTER_EPOCH: i64 = 1_577_836_800;

const INDEX_HTML: &str = include_str!("../web/index.html");
const STYLE_CSS: &str = include_str!("../web/style.css");

struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("starting hsc-node {FIRMWARE_VERSION}");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = Arc::new(NvsStore {
        partition: nvs_partition.clone(),
        lock: Mutex::new(()),
    });

    let device = DeviceHandle::boot(store);
    let config = device.config();
    info!(
        "board {} ({}), wifi `{}`",
        config.board_id,
        config.device_name(),
        config.wifi_ssid
    );

    let peripherals = Peripherals::take()?;
    let modem = peripherals.modem;
    let led_pin = peripherals.pins.gpio2;
    let button_pin = peripherals.pins.gpio4;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let loop_device = device.clone();
    let device_loop = thread::Builder::new()
        .name("device-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || -> anyhow::Result<()> {
            add_current_task_to_watchdog()?;

            let network = EspNetwork::new(modem, sys_loop, nvs_partition)?;
            let broker = EspBroker::new(&config);
            let io = EspIo::new(led_pin, button_pin)?;
            let system = EspSystem::new();

            let mut runtime = Runtime::new(loop_device, network, broker, io, system);
            runtime.run(LOOP_IDLE_MS);

            info!("restarting");
            esp_idf_svc::hal::reset::restart();
        })
        .context("failed to spawn device loop")?;

    let server = create_http_server(device)?;

    // Keep the server alive for the program lifetime.
    let _server = server;

    match device_loop.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("device loop panicked")),
    }
}

fn create_http_server(device: DeviceHandle) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let page = api::render_index(&device, INDEX_HTML);
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/css")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/favicon.ico", Method::Get, move |req| {
        req.into_status_response(204)?;
        Ok(())
    })?;

    {
        let device = device.clone();
        server.fn_handler("/api/settings", Method::Get, move |req| {
            write_json(req, 200, &api::settings(&device))
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/settings", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_api(req, bad_request(&err.to_string())),
            };
            write_api(req, api::save_settings(&device, &body))
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/reset", Method::Post, move |req| {
            write_api(req, api::reset_settings(&device))
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/locate", Method::Post, move |mut req| {
            let uri = req.uri().to_string();
            let form = read_request_body(&mut req)
                .ok()
                .and_then(|body| String::from_utf8(body).ok())
                .and_then(|body| form_param(&body, "state"));
            let query = query_param(&uri, "state");
            write_api(
                req,
                api::set_locate(&device, form.as_deref(), query.as_deref()),
            )
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/restart", Method::Post, move |req| {
            write_api(req, api::restart(&device))
        })?;
    }

    server.fn_handler("/api/status", Method::Get, move |req| {
        write_json(req, 200, &device.status())
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = api::request_body_len(req.content_len())
        .ok_or_else(|| anyhow!("request body too large"))?;

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_api(req: Request<&mut EspHttpConnection<'_>>, response: ApiResponse) -> anyhow::Result<()> {
    write_json(req, response.code, &response.reply)
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    form_param(uri.split_once('?')?.1, key)
}

fn form_param(encoded: &str, key: &str) -> Option<String> {
    for pair in encoded.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn bad_request(message: &str) -> ApiResponse {
    ApiResponse {
        code: 400,
        reply: ApiReply::error(message),
    }
}

impl ConfigStore for NvsStore {
    fn load(&self) -> DeviceConfig {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut nvs = match EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true) {
            Ok(nvs) => nvs,
            Err(err) => {
                warn!("failed to open NVS namespace `{NVS_NAMESPACE}`: {err}; using defaults");
                return DeviceConfig::default();
            }
        };

        let mut buffer = vec![0_u8; NVS_READ_BUFFER];
        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer) {
            Ok(Some(value)) => decode_record(value.as_bytes()),
            Ok(None) => {
                info!("no persisted config; using defaults");
                DeviceConfig::default()
            }
            Err(err) => {
                warn!("failed to read persisted config: {err}; using defaults");
                DeviceConfig::default()
            }
        }
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let payload = encode_record(config)?;
        let payload =
            String::from_utf8(payload).map_err(|err| StoreError::Backend(err.to_string()))?;

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        // NVS commits a single key atomically; a torn write keeps the old value.
        nvs.set_str(NVS_CONFIG_KEY, &payload)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

struct EspNetwork {
    wifi: EspWifi<'static>,
    mac: [u8; 6],
    sntp: Option<EspSntp<'static>>,
    fallback_up: bool,
}

impl EspNetwork {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        let mac = wifi.sta_netif().get_mac()?;

        let hostname = hostname_from_mac(mac);
        if let Err(err) = wifi.sta_netif_mut().set_hostname(&hostname) {
            warn!("failed to set hostname `{hostname}`: {err}");
        }

        Ok(Self {
            wifi,
            mac,
            sntp: None,
            fallback_up: false,
        })
    }

    fn station_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }
}

fn backend(err: impl core::fmt::Display) -> NetworkError {
    NetworkError::Backend(err.to_string())
}

impl NetworkPort for EspNetwork {
    fn begin_join(&mut self, ssid: &str, passphrase: &str) -> Result<(), NetworkError> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| NetworkError::Backend("wifi ssid too long".into()))?,
                password: passphrase
                    .try_into()
                    .map_err(|_| NetworkError::Backend("wifi password too long".into()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(backend)?;

        self.wifi.start().map_err(backend)?;
        disable_wifi_power_save();
        self.wifi.connect().map_err(backend)
    }

    fn status(&mut self) -> JoinStatus {
        if self.station_up() {
            JoinStatus::Joined
        } else {
            JoinStatus::Joining
        }
    }

    fn start_fallback_advertise(
        &mut self,
        ssid: &str,
        passphrase: &str,
    ) -> Result<(), NetworkError> {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| NetworkError::Backend("fallback AP SSID too long".into()))?,
                password: passphrase
                    .try_into()
                    .map_err(|_| NetworkError::Backend("fallback AP password too long".into()))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))
            .map_err(backend)?;

        self.wifi.start().map_err(backend)?;
        self.fallback_up = true;
        Ok(())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        if !self.station_up() {
            return None;
        }
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn fallback_address(&self) -> Option<Ipv4Addr> {
        if !self.fallback_up {
            return None;
        }
        self.wifi.ap_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn rssi_dbm(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn start_time_sync(&mut self) -> Result<(), NetworkError> {
        if self.sntp.is_none() {
            let mut conf = SntpConf::default();
            assign_time_servers(&mut conf.servers);
            self.sntp = Some(EspSntp::new(&conf).map_err(backend)?);
        }
        Ok(())
    }
}

enum LinkEvent {
    Up,
    Down(String),
}

/// Blocking connect over the ESP-IDF MQTT client. A receiver thread pumps
/// connection events into a channel the device loop waits on.
struct EspBroker {
    url: String,
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<LinkEvent>>,
    connected: Arc<AtomicBool>,
}

impl EspBroker {
    fn new(config: &DeviceConfig) -> Self {
        Self {
            url: format!("mqtt://{}:{}", config.mqtt_server, config.mqtt_port),
            client: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn shutdown(&mut self) {
        // Dropping the client ends the receiver thread.
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl BrokerClient for EspBroker {
    fn connect(&mut self, client_id: &str, user: &str, password: &str) -> Result<(), BrokerError> {
        self.shutdown();

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: (!user.is_empty()).then_some(user),
            password: (!password.is_empty()).then_some(password),
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(self.url.as_str(), &conf)
            .map_err(|err| BrokerError::Transport(err.to_string()))?;

        let (tx, rx) = mpsc::channel();
        spawn_mqtt_receiver(conn, self.connected.clone(), tx)?;
        self.client = Some(client);

        match rx.recv_timeout(MQTT_CONNECT_TIMEOUT) {
            Ok(LinkEvent::Up) => {
                self.events = Some(rx);
                Ok(())
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
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, retained, payload)
            .map(|_| ())
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn poll(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::Down(reason) = event {
                warn!("mqtt link down: {reason}");
            }
        }
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    connected: Arc<AtomicBool>,
    events: Sender<LinkEvent>,
) -> Result<(), BrokerError> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::Relaxed);
                        let _ = events.send(LinkEvent::Up);
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                        let _ = events.send(LinkEvent::Down("disconnected".into()));
                    }
                    EventPayload::Error(err) => {
                        let _ = events.send(LinkEvent::Down(format!("{err:?}")));
                    }
                    _ => {}
                }
            }
            connected.store(false, Ordering::Relaxed);
        })
        .map(|_| ())
        .map_err(|err| BrokerError::Transport(format!("failed to spawn mqtt receiver: {err}")))
}

struct EspIo {
    led: PinDriver<'static, Gpio2, Output>,
    button: PinDriver<'static, Gpio4, Input>,
}

impl EspIo {
    fn new(led: Gpio2, button: Gpio4) -> anyhow::Result<Self> {
        let mut led = PinDriver::output(led)?;
        led.set_low()?;
        let mut button = PinDriver::input(button)?;
        button.set_pull(Pull::Up)?;
        Ok(Self { led, button })
    }
}

impl DigitalIo for EspIo {
    fn read(&mut self, pin: u8) -> Level {
        if pin == RESET_BUTTON_PIN && self.button.is_low() {
            Level::Low
        } else {
            Level::High
        }
    }

    fn write(&mut self, pin: u8, level: Level) {
        if pin != LED_PIN {
            return;
        }
        let result = match level {
            Level::High => self.led.set_high(),
            Level::Low => self.led.set_low(),
        };
        if let Err(err) = result {
            warn!("failed to drive gpio{pin}: {err}");
        }
    }
}

struct EspSystem {
    started: Instant,
}

impl EspSystem {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl SystemPort for EspSystem {
    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// Sleeps in slices so the watchdog stays fed through the broker's
    /// reconnect wait.
    fn delay_ms(&mut self, ms: u64) {
        let mut remaining = ms;
        loop {
            feed_watchdog();
            if remaining == 0 {
                break;
            }
            let slice = remaining.min(1_000);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
    }

    fn free_heap_bytes(&self) -> Option<u32> {
        Some(unsafe { esp_idf_svc::sys::esp_get_free_heap_size() })
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        (now.timestamp() > CLOCK_VALID_AFTER_EPOCH).then_some(now)
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
