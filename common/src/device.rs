use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use log::info;

use crate::{
    broker::BrokerState,
    config::DeviceConfig,
    error::StoreError,
    network::ConnectionState,
    status::{
        format_datetime, format_free_memory, format_rssi, format_uptime, BrokerStatus,
        DeviceStatus,
    },
    store::ConfigStore,
};

/// Read-only readings refreshed by the runtime loop once per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub network: ConnectionState,
    pub broker: BrokerState,
    pub hostname: String,
    pub station_address: Option<Ipv4Addr>,
    pub fallback_address: Option<Ipv4Addr>,
    pub rssi_dbm: Option<i8>,
    pub free_heap_bytes: Option<u32>,
    pub wall_clock: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            network: ConnectionState::Disconnected,
            broker: BrokerState::Idle,
            hostname: String::new(),
            station_address: None,
            fallback_address: None,
            rssi_dbm: None,
            free_heap_bytes: None,
            wall_clock: None,
            uptime_ms: 0,
        }
    }
}

impl Telemetry {
    /// Station address while joined, else the fallback AP address.
    pub fn display_address(&self) -> Option<Ipv4Addr> {
        self.station_address.or(self.fallback_address)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            uptime: format_uptime(self.uptime_ms),
            rssi: format_rssi(self.rssi_dbm),
            free_memory: format_free_memory(self.free_heap_bytes),
            runtime: format_datetime(self.wall_clock),
        }
    }
}

/// Everything the loop and the HTTP layer share: the single working config,
/// the locate and reboot flags, and the latest telemetry.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub config: DeviceConfig,
    pub locate_active: bool,
    pub reboot_requested: bool,
    pub telemetry: Telemetry,
}

impl DeviceContext {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            locate_active: false,
            reboot_requested: false,
            telemetry: Telemetry::default(),
        }
    }
}

/// Cloneable entry point into the device context.
///
/// Config writes go through here so the HTTP handlers and the reset button
/// serialize on the same lock and the same store.
#[derive(Clone)]
pub struct DeviceHandle {
    context: Arc<Mutex<DeviceContext>>,
    store: Arc<dyn ConfigStore>,
}

impl DeviceHandle {
    /// Load the persisted config (or defaults) into a fresh context.
    pub fn boot(store: Arc<dyn ConfigStore>) -> Self {
        let config = store.load();
        info!(
            "loaded config: board {} at `{}`, broker {}:{}",
            config.board_id, config.location, config.mqtt_server, config.mqtt_port
        );
        Self {
            context: Arc::new(Mutex::new(DeviceContext::new(config))),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceContext> {
        self.context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> DeviceConfig {
        self.lock().config.clone()
    }

    /// Persist `config` and make it the working copy. A reboot is requested
    /// on success; on failure the working copy is untouched.
    pub fn save_config(&self, config: DeviceConfig) -> Result<(), StoreError> {
        let mut ctx = self.lock();
        self.commit(&mut ctx, config)
    }

    fn commit(&self, ctx: &mut DeviceContext, config: DeviceConfig) -> Result<(), StoreError> {
        self.store.save(&config)?;
        info!("config saved for board {}; reboot pending", config.board_id);
        ctx.config = config;
        ctx.reboot_requested = true;
        Ok(())
    }

    pub fn reset_config(&self) -> Result<(), StoreError> {
        let mut ctx = self.lock();
        self.store.reset()?;
        info!("config reset to defaults; reboot pending");
        ctx.config = DeviceConfig::default();
        ctx.reboot_requested = true;
        Ok(())
    }

    /// Long-press recovery: restore the station passphrase only.
    pub fn reset_wifi_password(&self) -> Result<(), StoreError> {
        let mut ctx = self.lock();
        let next = ctx.config.with_factory_wifi_password();
        self.commit(&mut ctx, next)
    }

    pub fn set_locate_active(&self, active: bool) {
        let mut ctx = self.lock();
        if ctx.locate_active != active {
            info!("locate {}", if active { "on" } else { "off" });
        }
        ctx.locate_active = active;
    }

    pub fn locate_active(&self) -> bool {
        self.lock().locate_active
    }

    pub fn request_restart(&self) {
        info!("restart requested");
        self.lock().reboot_requested = true;
    }

    pub fn reboot_requested(&self) -> bool {
        self.lock().reboot_requested
    }

    pub fn telemetry(&self) -> Telemetry {
        self.lock().telemetry.clone()
    }

    pub fn update_telemetry(&self, telemetry: Telemetry) {
        let mut ctx = self.lock();
        if ctx.telemetry.network != telemetry.network {
            info!(
                "network {} -> {}",
                ctx.telemetry.network.as_str(),
                telemetry.network.as_str()
            );
        }
        if ctx.telemetry.broker != telemetry.broker {
            info!(
                "broker {} -> {}",
                ctx.telemetry.broker.as_str(),
                telemetry.broker.as_str()
            );
        }
        ctx.telemetry = telemetry;
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock().telemetry.status()
    }

    pub fn broker_status(&self) -> BrokerStatus {
        let ctx = self.lock();
        BrokerStatus::from_parts(
            ctx.config.board_id,
            ctx.telemetry.broker == BrokerState::Connected,
        )
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("context", &*self.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::FACTORY_RESET_WIFI_PASSWORD, testing::MemoryConfigStore};

    fn configured() -> DeviceConfig {
        DeviceConfig {
            board_id: 7,
            wifi_password: "secret".to_string(),
            location: "Yard".to_string(),
            ..DeviceConfig::default()
        }
    }

    fn handle_with(store: Arc<MemoryConfigStore>) -> DeviceHandle {
        DeviceHandle::boot(store)
    }

    #[test]
    fn boot_loads_persisted_config() {
        let store = Arc::new(MemoryConfigStore::with_config(&configured()));
        let handle = handle_with(store);

        assert_eq!(handle.config(), configured());
        assert!(!handle.reboot_requested());
    }

    #[test]
    fn save_replaces_working_copy_and_requests_reboot() {
        let store = Arc::new(MemoryConfigStore::default());
        let handle = handle_with(store.clone());

        handle.save_config(configured()).unwrap();

        assert_eq!(handle.config(), configured());
        assert_eq!(store.load(), configured());
        assert!(handle.reboot_requested());
    }

    #[test]
    fn failed_save_keeps_working_copy() {
        let store = Arc::new(MemoryConfigStore::with_config(&configured()));
        store.fail_writes.store(true, Ordering::SeqCst);
        let handle = handle_with(store.clone());

        let next = DeviceConfig {
            board_id: 9,
            ..configured()
        };
        assert!(handle.save_config(next).is_err());

        assert_eq!(handle.config(), configured());
        assert!(!handle.reboot_requested());
    }

    #[test]
    fn invalid_config_is_not_applied() {
        let store = Arc::new(MemoryConfigStore::default());
        let handle = handle_with(store.clone());

        let bad = DeviceConfig {
            mqtt_port: 0,
            ..configured()
        };
        let err = handle.save_config(bad).unwrap_err();

        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(handle.config(), DeviceConfig::default());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn reset_restores_defaults() {
        let store = Arc::new(MemoryConfigStore::with_config(&configured()));
        let handle = handle_with(store.clone());

        handle.reset_config().unwrap();

        assert_eq!(handle.config(), DeviceConfig::default());
        assert_eq!(store.load(), DeviceConfig::default());
        assert!(handle.reboot_requested());
    }

    #[test]
    fn wifi_password_reset_keeps_identity() {
        let store = Arc::new(MemoryConfigStore::with_config(&configured()));
        let handle = handle_with(store.clone());

        handle.reset_wifi_password().unwrap();

        let saved = store.load();
        assert_eq!(saved.wifi_password, FACTORY_RESET_WIFI_PASSWORD);
        assert_eq!(saved.board_id, 7);
        assert_eq!(saved.location, "Yard");
        assert!(handle.reboot_requested());
    }

    #[test]
    fn locate_and_restart_flags() {
        let handle = handle_with(Arc::new(MemoryConfigStore::default()));

        handle.set_locate_active(true);
        assert!(handle.locate_active());
        handle.set_locate_active(false);
        assert!(!handle.locate_active());

        handle.request_restart();
        assert!(handle.reboot_requested());
    }

    #[test]
    fn status_reflects_telemetry() {
        let handle = handle_with(Arc::new(MemoryConfigStore::with_config(&configured())));
        handle.update_telemetry(Telemetry {
            network: ConnectionState::Connected,
            broker: BrokerState::Connected,
            rssi_dbm: Some(-61),
            free_heap_bytes: Some(180_224),
            uptime_ms: 65_000,
            ..Telemetry::default()
        });

        assert_eq!(
            handle.status(),
            DeviceStatus {
                uptime: "1m 05s".to_string(),
                rssi: "-61 dBm".to_string(),
                free_memory: "176.0 KB".to_string(),
                runtime: "Not synced".to_string(),
            }
        );
        assert_eq!(handle.broker_status(), BrokerStatus::Connected);
    }
}
