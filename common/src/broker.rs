use std::net::Ipv4Addr;

use log::{info, warn};

use crate::{
    config::DeviceConfig,
    ports::{BrokerClient, SystemPort},
    topics::{
        announcement_payload, device_status_topic, STATUS_ONLINE, TOPIC_DEVICE_ANNOUNCE,
    },
};

pub const BROKER_RETRY_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Idle,
    Connecting,
    Connected,
}

impl BrokerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// What the broker controller needs from the working config, copied out so no
/// borrow of the config survives into the (blocking) reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSession {
    pub board_id: u32,
    pub client_id: String,
    pub user: String,
    pub password: String,
    pub hostname: String,
    pub address: Option<Ipv4Addr>,
}

impl BrokerSession {
    pub fn new(config: &DeviceConfig, hostname: String, address: Option<Ipv4Addr>) -> Self {
        Self {
            board_id: config.board_id,
            client_id: config.client_id(),
            user: config.mqtt_user.clone(),
            password: config.mqtt_password.clone(),
            hostname,
            address,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerController {
    state: BrokerState,
    connections: u32,
}

impl Default for BrokerController {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerController {
    pub fn new() -> Self {
        Self {
            state: BrokerState::Idle,
            connections: 0,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Successful (re)connections this boot.
    pub fn connections(&self) -> u32 {
        self.connections
    }

    /// Reconnect if needed, then drain inbound traffic.
    ///
    /// Blocks while the broker is unreachable, retrying every
    /// [`BROKER_RETRY_DELAY_MS`] until a connection succeeds or `abort`
    /// returns `true`. `abort` is checked before every attempt.
    pub fn service<B, S, A>(
        &mut self,
        session: &BrokerSession,
        network_ready: bool,
        client: &mut B,
        system: &mut S,
        abort: A,
    ) where
        B: BrokerClient,
        S: SystemPort,
        A: Fn() -> bool,
    {
        if !network_ready || session.board_id == 0 {
            self.state = BrokerState::Idle;
            return;
        }

        if !client.connected() {
            if self.state == BrokerState::Connected {
                warn!("broker connection lost");
            }
            if !self.reconnect(session, client, system, abort) {
                return;
            }
        }

        client.poll();
    }

    /// Returns `false` when abandoned before a connection was made.
    fn reconnect<B, S, A>(
        &mut self,
        session: &BrokerSession,
        client: &mut B,
        system: &mut S,
        abort: A,
    ) -> bool
    where
        B: BrokerClient,
        S: SystemPort,
        A: Fn() -> bool,
    {
        self.state = BrokerState::Connecting;

        while !client.connected() {
            if abort() {
                info!("abandoning mqtt reconnect");
                return false;
            }
            info!("attempting MQTT connection as `{}`", session.client_id);
            match client.connect(&session.client_id, &session.user, &session.password) {
                Ok(()) => {
                    info!("mqtt connected");
                    self.state = BrokerState::Connected;
                    self.connections = self.connections.saturating_add(1);
                    announce(session, client);
                    return true;
                }
                Err(err) => {
                    warn!(
                        "mqtt connect failed: {err}; retrying in {}s",
                        BROKER_RETRY_DELAY_MS / 1000
                    );
                    system.delay_ms(BROKER_RETRY_DELAY_MS);
                }
            }
        }
        true
    }
}

/// Retained identity first so late subscribers learn it, then transient
/// liveness.
fn announce<B: BrokerClient>(session: &BrokerSession, client: &mut B) {
    let address = session
        .address
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string());
    let payload = announcement_payload(&session.client_id, &session.hostname, &address);

    if let Err(err) = client.publish(TOPIC_DEVICE_ANNOUNCE, payload.as_bytes(), true) {
        warn!("failed to publish announcement: {err}");
    }

    let status_topic = device_status_topic(session.board_id);
    if let Err(err) = client.publish(&status_topic, STATUS_ONLINE.as_bytes(), false) {
        warn!("failed to publish online status: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{ManualClock, MockBroker, Published};

    fn session(board_id: u32) -> BrokerSession {
        let config = DeviceConfig {
            board_id,
            mqtt_user: "node".to_string(),
            mqtt_password: "pw".to_string(),
            ..DeviceConfig::default()
        };
        BrokerSession::new(
            &config,
            "esp32-AB0C9E".to_string(),
            Some(Ipv4Addr::new(192, 168, 1, 40)),
        )
    }

    #[test]
    fn unconfigured_board_never_connects() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        for network_ready in [false, true, true] {
            controller.service(&session(0), network_ready, &mut client, &mut clock, || false);
        }

        assert_eq!(controller.state(), BrokerState::Idle);
        assert!(client.connect_attempts.is_empty());
        assert_eq!(client.polls, 0);
    }

    #[test]
    fn no_network_stays_idle() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        controller.service(&session(7), false, &mut client, &mut clock, || false);

        assert_eq!(controller.state(), BrokerState::Idle);
        assert!(client.connect_attempts.is_empty());
    }

    #[test]
    fn connect_publishes_announcement_then_status() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        controller.service(&session(7), true, &mut client, &mut clock, || false);

        assert_eq!(controller.state(), BrokerState::Connected);
        assert_eq!(
            client.connect_attempts,
            vec![(
                "HSC-Device-7".to_string(),
                "node".to_string(),
                "pw".to_string()
            )]
        );
        assert_eq!(
            client.published,
            vec![
                Published {
                    topic: "hsc/device/announce".to_string(),
                    payload: "HSC-Device-7,esp32-AB0C9E,192.168.1.40".to_string(),
                    retained: true,
                },
                Published {
                    topic: "hsc/device/status/7".to_string(),
                    payload: "online".to_string(),
                    retained: false,
                },
            ]
        );
        assert_eq!(client.polls, 1);
        assert!(clock.delays.is_empty());
    }

    #[test]
    fn failed_connects_wait_between_retries() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker {
            failures_before_connect: 3,
            ..MockBroker::default()
        };
        let mut clock = ManualClock::default();

        controller.service(&session(7), true, &mut client, &mut clock, || false);

        assert_eq!(controller.state(), BrokerState::Connected);
        assert_eq!(client.connect_attempts.len(), 4);
        assert_eq!(clock.delays, vec![BROKER_RETRY_DELAY_MS; 3]);
        assert_eq!(client.published.len(), 2);
    }

    #[test]
    fn abort_ends_retries_after_the_current_wait() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker {
            failures_before_connect: usize::MAX,
            ..MockBroker::default()
        };
        let mut clock = ManualClock::default();
        let attempts = Cell::new(0);

        controller.service(&session(7), true, &mut client, &mut clock, || {
            attempts.set(attempts.get() + 1);
            attempts.get() > 2
        });

        assert_eq!(controller.state(), BrokerState::Connecting);
        assert_eq!(client.connect_attempts.len(), 2);
        assert_eq!(clock.delays, vec![BROKER_RETRY_DELAY_MS; 2]);
        assert!(client.published.is_empty());
        assert_eq!(client.polls, 0);
    }

    #[test]
    fn abort_before_first_attempt_skips_connect() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        controller.service(&session(7), true, &mut client, &mut clock, || true);

        assert!(client.connect_attempts.is_empty());
        assert!(clock.delays.is_empty());
    }

    #[test]
    fn connected_client_is_only_polled() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        controller.service(&session(7), true, &mut client, &mut clock, || false);
        controller.service(&session(7), true, &mut client, &mut clock, || false);
        controller.service(&session(7), true, &mut client, &mut clock, || false);

        assert_eq!(client.connect_attempts.len(), 1);
        assert_eq!(client.published.len(), 2);
        assert_eq!(client.polls, 3);
    }

    #[test]
    fn lost_connection_reannounces() {
        let mut controller = BrokerController::new();
        let mut client = MockBroker::default();
        let mut clock = ManualClock::default();

        controller.service(&session(7), true, &mut client, &mut clock, || false);
        client.drop_connection();
        controller.service(&session(7), true, &mut client, &mut clock, || false);

        assert_eq!(controller.state(), BrokerState::Connected);
        assert_eq!(controller.connections(), 2);
        assert_eq!(client.published.len(), 4);
        assert_eq!(client.published[2].topic, TOPIC_DEVICE_ANNOUNCE);
    }
}
