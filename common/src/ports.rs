//! Hardware and platform seams consumed by the lifecycle core.
//!
//! The host simulation and the ESP-IDF build each provide one implementation
//! of every trait; unit tests use the recording mocks in `testing`.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::error::{BrokerError, NetworkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Joined,
    Joining,
    Failed,
}

/// Station/AP control of the network interface.
pub trait NetworkPort {
    fn begin_join(&mut self, ssid: &str, passphrase: &str) -> Result<(), NetworkError>;

    fn status(&mut self) -> JoinStatus;

    fn start_fallback_advertise(&mut self, ssid: &str, passphrase: &str)
        -> Result<(), NetworkError>;

    /// Station address while joined.
    fn local_address(&self) -> Option<Ipv4Addr>;

    /// Address of the self-hosted network while advertising it.
    fn fallback_address(&self) -> Option<Ipv4Addr>;

    fn rssi_dbm(&self) -> Option<i8>;

    fn mac_address(&self) -> [u8; 6];

    /// Kick off background wall-clock synchronization. Best effort.
    fn start_time_sync(&mut self) -> Result<(), NetworkError>;
}

/// Publish/connect view of the message broker client.
pub trait BrokerClient {
    fn connect(&mut self, client_id: &str, user: &str, password: &str) -> Result<(), BrokerError>;

    fn connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BrokerError>;

    /// Drain inbound traffic; must be called every loop pass once connected.
    fn poll(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn toggled(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

pub trait DigitalIo {
    fn read(&mut self, pin: u8) -> Level;

    fn write(&mut self, pin: u8, level: Level);
}

/// Monotonic time, blocking delay and board health readings.
pub trait SystemPort {
    fn now_ms(&self) -> u64;

    fn delay_ms(&mut self, ms: u64);

    fn free_heap_bytes(&self) -> Option<u32>;

    /// `None` until the wall clock has been synchronized.
    fn wall_clock(&self) -> Option<DateTime<Utc>>;
}
