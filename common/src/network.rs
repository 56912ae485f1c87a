use log::{info, warn};

use crate::{
    config::{DeviceConfig, FALLBACK_AP_PASSWORD, FALLBACK_AP_SSID},
    ports::{JoinStatus, NetworkPort},
};

pub const JOIN_POLL_INTERVAL_MS: u64 = 500;
pub const JOIN_MAX_ATTEMPTS: u32 = 20;

/// NTP servers in priority order.
pub const TIME_SERVERS: [&str; 2] = ["pool.ntp.org", "time.nist.gov"];

/// Write [`TIME_SERVERS`] into the leading `slots`; SNTP builds with fewer
/// slots keep the highest-priority servers, extra slots are left as they are.
pub fn assign_time_servers(slots: &mut [&'static str]) {
    for (slot, server) in slots.iter_mut().zip(TIME_SERVERS) {
        *slot = server;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    FallbackProvisioning,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::FallbackProvisioning => "FALLBACK_PROVISIONING",
        }
    }
}

/// Joins the configured station network or gives up into fallback
/// provisioning. Never blocks: each `poll` checks status at most once.
///
/// Fallback is only entered from the boot-time join. A link lost after that
/// is rejoined indefinitely.
#[derive(Debug, Clone)]
pub struct NetworkController {
    state: ConnectionState,
    attempts: u32,
    last_check_ms: u64,
    time_sync_started: bool,
    ever_connected: bool,
}

impl Default for NetworkController {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkController {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_check_ms: 0,
            time_sync_started: false,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn poll<N: NetworkPort>(&mut self, config: &DeviceConfig, net: &mut N, now_ms: u64) {
        match self.state {
            ConnectionState::Disconnected => self.begin(config, net, now_ms),
            ConnectionState::Connecting => self.check_join(config, net, now_ms),
            ConnectionState::Connected => self.check_link(net, now_ms),
            ConnectionState::FallbackProvisioning => {}
        }
    }

    fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_check_ms) < JOIN_POLL_INTERVAL_MS {
            return false;
        }
        self.last_check_ms = now_ms;
        true
    }

    fn check_link<N: NetworkPort>(&mut self, net: &mut N, now_ms: u64) {
        if !self.due(now_ms) || net.status() == JoinStatus::Joined {
            return;
        }
        warn!("wifi link lost");
        self.state = ConnectionState::Disconnected;
    }

    fn begin<N: NetworkPort>(&mut self, config: &DeviceConfig, net: &mut N, now_ms: u64) {
        if !config.has_station_credentials() {
            warn!("wifi credentials missing; skipping station join");
            self.enter_fallback(net);
            return;
        }

        info!("connecting to `{}`", config.wifi_ssid);
        if let Err(err) = net.begin_join(&config.wifi_ssid, &config.wifi_password) {
            warn!("failed to start station join: {err}");
        }
        self.attempts = 0;
        self.last_check_ms = now_ms;
        self.state = ConnectionState::Connecting;
    }

    fn check_join<N: NetworkPort>(&mut self, config: &DeviceConfig, net: &mut N, now_ms: u64) {
        if !self.due(now_ms) {
            return;
        }

        if net.status() == JoinStatus::Joined {
            self.state = ConnectionState::Connected;
            self.ever_connected = true;
            match net.local_address() {
                Some(addr) => info!("wifi connected, address {addr}"),
                None => info!("wifi connected"),
            }
            self.start_time_sync(net);
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < JOIN_MAX_ATTEMPTS {
            return;
        }
        if self.ever_connected {
            warn!("wifi rejoin still pending after {} attempts; retrying", self.attempts);
            self.begin(config, net, now_ms);
        } else {
            warn!("wifi join failed after {} attempts", self.attempts);
            self.enter_fallback(net);
        }
    }

    fn start_time_sync<N: NetworkPort>(&mut self, net: &mut N) {
        if self.time_sync_started {
            return;
        }
        self.time_sync_started = true;
        match net.start_time_sync() {
            Ok(()) => info!("time sync configured (will sync in background)"),
            Err(err) => warn!("time sync unavailable: {err}"),
        }
    }

    fn enter_fallback<N: NetworkPort>(&mut self, net: &mut N) {
        self.state = ConnectionState::FallbackProvisioning;
        match net.start_fallback_advertise(FALLBACK_AP_SSID, FALLBACK_AP_PASSWORD) {
            Ok(()) => match net.fallback_address() {
                Some(addr) => info!("fallback AP `{FALLBACK_AP_SSID}` up at {addr}"),
                None => info!("fallback AP `{FALLBACK_AP_SSID}` up"),
            },
            Err(err) => warn!("failed to start fallback AP: {err}"),
        }
    }
}
