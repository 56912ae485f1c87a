pub mod api;
pub mod broker;
pub mod button;
pub mod config;
pub mod device;
pub mod error;
pub mod locate;
pub mod network;
pub mod ports;
pub mod runtime;
pub mod status;
pub mod store;
pub mod template;
pub mod topics;

#[cfg(test)]
mod testing;

pub use broker::{BrokerController, BrokerSession, BrokerState};
pub use button::{ResetGesture, ResetMonitor};
pub use config::{DeviceConfig, DeviceConfigUpdate};
pub use device::{DeviceContext, DeviceHandle, Telemetry};
pub use error::{BrokerError, NetworkError, StoreError};
pub use network::{ConnectionState, NetworkController};
pub use ports::{BrokerClient, DigitalIo, JoinStatus, Level, NetworkPort, SystemPort};
pub use runtime::{LoopOutcome, Pins, Runtime};
pub use status::{BrokerStatus, DeviceStatus};
pub use store::{ConfigStore, FileConfigStore};
pub use topics::*;
