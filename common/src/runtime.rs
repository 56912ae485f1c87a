use log::{info, warn};

use crate::{
    broker::{BrokerController, BrokerSession},
    button::ResetMonitor,
    device::{DeviceHandle, Telemetry},
    locate::LocateIndicator,
    network::NetworkController,
    ports::{BrokerClient, DigitalIo, Level, NetworkPort, SystemPort},
    topics::hostname_from_mac,
};

pub const LED_PIN: u8 = 2;
pub const RESET_BUTTON_PIN: u8 = 4;

/// Pause between a reboot request being seen and the restart, so in-flight
/// HTTP replies get out.
pub const REBOOT_GRACE_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pins {
    pub led: u8,
    pub reset_button: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            led: LED_PIN,
            reset_button: RESET_BUTTON_PIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Continue,
    /// The caller must restart the device now.
    Restart,
}

/// Cooperative single-threaded device loop.
///
/// Owns every controller and every port; shared state lives behind the
/// [`DeviceHandle`] and is read fresh on each pass.
pub struct Runtime<N, B, G, S> {
    handle: DeviceHandle,
    network: N,
    broker: B,
    io: G,
    system: S,
    pins: Pins,
    hostname: String,
    network_ctl: NetworkController,
    broker_ctl: BrokerController,
    reset: ResetMonitor,
    locate: LocateIndicator,
}

impl<N, B, G, S> Runtime<N, B, G, S>
where
    N: NetworkPort,
    B: BrokerClient,
    G: DigitalIo,
    S: SystemPort,
{
    pub fn new(handle: DeviceHandle, network: N, broker: B, io: G, system: S) -> Self {
        Self::with_pins(handle, network, broker, io, system, Pins::default())
    }

    pub fn with_pins(
        handle: DeviceHandle,
        network: N,
        broker: B,
        mut io: G,
        system: S,
        pins: Pins,
    ) -> Self {
        io.write(pins.led, Level::Low);
        let hostname = hostname_from_mac(network.mac_address());
        info!("hostname {hostname}");

        Self {
            handle,
            network,
            broker,
            io,
            system,
            pins,
            hostname,
            network_ctl: NetworkController::new(),
            broker_ctl: BrokerController::new(),
            reset: ResetMonitor::new(),
            locate: LocateIndicator::new(pins.led),
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn network_controller(&self) -> &NetworkController {
        &self.network_ctl
    }

    pub fn broker_controller(&self) -> &BrokerController {
        &self.broker_ctl
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn io(&self) -> &G {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut G {
        &mut self.io
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    /// One pass of the loop.
    pub fn step(&mut self) -> LoopOutcome {
        if self.handle.reboot_requested() {
            info!("rebooting in {REBOOT_GRACE_MS}ms");
            self.system.delay_ms(REBOOT_GRACE_MS);
            return LoopOutcome::Restart;
        }

        let now_ms = self.system.now_ms();

        let level = self.io.read(self.pins.reset_button);
        if self.reset.service(level, now_ms) {
            self.factory_reset();
        }

        self.locate
            .service(self.handle.locate_active(), &mut self.io, now_ms);

        let config = self.handle.config();
        self.network_ctl.poll(&config, &mut self.network, now_ms);

        if config.is_configured() {
            let session = BrokerSession::new(
                &config,
                self.hostname.clone(),
                self.network.local_address(),
            );
            let handle = &self.handle;
            self.broker_ctl.service(
                &session,
                self.network_ctl.is_connected(),
                &mut self.broker,
                &mut self.system,
                || handle.reboot_requested(),
            );
        }

        self.publish_telemetry();
        LoopOutcome::Continue
    }

    /// Step until a restart is due, pausing `idle_ms` between passes.
    pub fn run(&mut self, idle_ms: u64) {
        while self.step() == LoopOutcome::Continue {
            if idle_ms > 0 {
                self.system.delay_ms(idle_ms);
            }
        }
    }

    fn factory_reset(&mut self) {
        info!("reset button held; restoring wifi passphrase");
        if let Err(err) = self.handle.reset_wifi_password() {
            warn!("failed to persist wifi passphrase reset: {err}");
        }
    }

    fn publish_telemetry(&mut self) {
        self.handle.update_telemetry(Telemetry {
            network: self.network_ctl.state(),
            broker: self.broker_ctl.state(),
            hostname: self.hostname.clone(),
            station_address: self.network.local_address(),
            fallback_address: self.network.fallback_address(),
            rssi_dbm: self.network.rssi_dbm(),
            free_heap_bytes: self.system.free_heap_bytes(),
            wall_clock: self.system.wall_clock(),
            uptime_ms: self.system.now_ms(),
        });
    }
}
