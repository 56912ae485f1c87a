//! Recording doubles for the platform ports.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use chrono::{DateTime, Utc};

use crate::{
    config::DeviceConfig,
    error::{BrokerError, NetworkError, StoreError},
    ports::{BrokerClient, DigitalIo, JoinStatus, Level, NetworkPort, SystemPort},
    store::{decode_record, encode_record, ConfigStore},
};

#[derive(Debug, Default)]
pub struct MockNetwork {
    /// Number of `status()` calls answered with `Joining` before `Joined`.
    /// `None` never joins.
    pub join_after: Option<usize>,
    pub status_calls: usize,
    pub joins: Vec<(String, String)>,
    pub fallbacks: Vec<(String, String)>,
    pub time_syncs: usize,
    /// Station link dropped by the access point.
    pub link_lost: bool,
}

impl MockNetwork {
    pub fn reachable() -> Self {
        Self {
            join_after: Some(0),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    fn joined(&self) -> bool {
        !self.link_lost
            && !self.joins.is_empty()
            && self
                .join_after
                .map(|after| self.status_calls > after)
                .unwrap_or(false)
    }
}

impl NetworkPort for MockNetwork {
    fn begin_join(&mut self, ssid: &str, passphrase: &str) -> Result<(), NetworkError> {
        self.joins.push((ssid.to_string(), passphrase.to_string()));
        Ok(())
    }

    fn status(&mut self) -> JoinStatus {
        self.status_calls += 1;
        if self.joined() {
            JoinStatus::Joined
        } else if self.join_after.is_none() && self.status_calls > 3 {
            JoinStatus::Failed
        } else {
            JoinStatus::Joining
        }
    }

    fn start_fallback_advertise(
        &mut self,
        ssid: &str,
        passphrase: &str,
    ) -> Result<(), NetworkError> {
        self.fallbacks.push((ssid.to_string(), passphrase.to_string()));
        Ok(())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.joined().then_some(Ipv4Addr::new(192, 168, 1, 40))
    }

    fn fallback_address(&self) -> Option<Ipv4Addr> {
        (!self.fallbacks.is_empty()).then_some(Ipv4Addr::new(192, 168, 4, 1))
    }

    fn rssi_dbm(&self) -> Option<i8> {
        self.joined().then_some(-61)
    }

    fn mac_address(&self) -> [u8; 6] {
        [0x24, 0x6f, 0x28, 0xab, 0x0c, 0x9e]
    }

    fn start_time_sync(&mut self) -> Result<(), NetworkError> {
        self.time_syncs += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

#[derive(Debug, Default)]
pub struct MockBroker {
    /// Connect attempts that fail before one succeeds.
    pub failures_before_connect: usize,
    pub connect_attempts: Vec<(String, String, String)>,
    pub published: Vec<Published>,
    pub polls: usize,
    pub is_connected: bool,
}

impl MockBroker {
    pub fn drop_connection(&mut self) {
        self.is_connected = false;
    }
}

impl BrokerClient for MockBroker {
    fn connect(&mut self, client_id: &str, user: &str, password: &str) -> Result<(), BrokerError> {
        self.connect_attempts
            .push((client_id.to_string(), user.to_string(), password.to_string()));
        if self.failures_before_connect > 0 {
            self.failures_before_connect -= 1;
            return Err(BrokerError::Refused(-2));
        }
        self.is_connected = true;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.is_connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BrokerError> {
        if !self.is_connected {
            return Err(BrokerError::NotConnected);
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            retained,
        });
        Ok(())
    }

    fn poll(&mut self) {
        self.polls += 1;
    }
}

#[derive(Debug, Default)]
pub struct MockIo {
    pub inputs: HashMap<u8, Level>,
    pub outputs: HashMap<u8, Level>,
    pub writes: Vec<(u8, Level)>,
}

impl MockIo {
    pub fn set_input(&mut self, pin: u8, level: Level) {
        self.inputs.insert(pin, level);
    }

    pub fn output(&self, pin: u8) -> Level {
        self.outputs.get(&pin).copied().unwrap_or(Level::Low)
    }
}

impl DigitalIo for MockIo {
    fn read(&mut self, pin: u8) -> Level {
        // Pulled-up input reads high when nothing drives it.
        self.inputs.get(&pin).copied().unwrap_or(Level::High)
    }

    fn write(&mut self, pin: u8, level: Level) {
        self.outputs.insert(pin, level);
        self.writes.push((pin, level));
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    pub now: u64,
    pub delays: Vec<u64>,
}

impl ManualClock {
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
    }
}

impl SystemPort for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now
    }

    fn delay_ms(&mut self, ms: u64) {
        self.delays.push(ms);
        self.now += ms;
    }

    fn free_heap_bytes(&self) -> Option<u32> {
        Some(180_224)
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    record: Mutex<Option<Vec<u8>>>,
    pub fail_writes: AtomicBool,
    pub saves: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn with_config(config: &DeviceConfig) -> Self {
        let store = Self::default();
        *store.record.lock().unwrap() = Some(serde_json::to_vec(config).unwrap());
        store
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> DeviceConfig {
        match self.record.lock().unwrap().as_deref() {
            Some(raw) => decode_record(raw),
            None => DeviceConfig::default(),
        }
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("flash write failed".to_string()));
        }
        let payload = encode_record(config)?;
        *self.record.lock().unwrap() = Some(payload);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
