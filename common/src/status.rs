use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Display zone for the wall clock (UTC-5, no DST).
pub const DISPLAY_UTC_OFFSET_SECS: i32 = -5 * 3600;

pub const NOT_SYNCED: &str = "Not synced";
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    Unconfigured,
    Connected,
    Disconnected,
}

impl BrokerStatus {
    pub fn from_parts(board_id: u32, connected: bool) -> Self {
        if board_id == 0 {
            Self::Unconfigured
        } else if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "Unconfigured",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// Live footer payload served by `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub uptime: String,
    pub rssi: String,
    pub free_memory: String,
    /// Wall-clock time; named for the page element that shows it.
    pub runtime: String,
}

pub fn format_uptime(uptime_ms: u64) -> String {
    let mut seconds = uptime_ms / 1000;
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;

    if days > 0 {
        format!("{days}d {hours:02}h {minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else {
        format!("{minutes}m {seconds:02}s")
    }
}

pub fn format_rssi(rssi_dbm: Option<i8>) -> String {
    match rssi_dbm {
        Some(rssi) => format!("{rssi} dBm"),
        None => NOT_APPLICABLE.to_string(),
    }
}

pub fn format_free_memory(free_bytes: Option<u32>) -> String {
    match free_bytes {
        Some(bytes) => format!("{:.1} KB", f64::from(bytes) / 1024.0),
        None => NOT_APPLICABLE.to_string(),
    }
}

pub fn format_datetime(now: Option<DateTime<Utc>>) -> String {
    let Some(now) = now else {
        return NOT_SYNCED.to_string();
    };
    match FixedOffset::east_opt(DISPLAY_UTC_OFFSET_SECS) {
        Some(zone) => now
            .with_timezone(&zone)
            .format("%m-%d-%y %H:%M:%S")
            .to_string(),
        None => now.format("%m-%d-%y %H:%M:%S").to_string(),
    }
}
