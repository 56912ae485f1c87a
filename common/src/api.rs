//! Transport-free request handling shared by the host and ESP HTTP servers.
//!
//! Each handler is a plain function of the request data and the
//! [`DeviceHandle`]; the servers only move bytes and status codes.

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{DeviceConfig, DeviceConfigUpdate},
    device::DeviceHandle,
    error::StoreError,
    status::{format_datetime, format_free_memory, format_rssi, format_uptime, FIRMWARE_VERSION},
    template,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiReply {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: Some(message.into()),
        }
    }

    pub fn ok() -> Self {
        Self {
            status: "success",
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub code: u16,
    pub reply: ApiReply,
}

impl ApiResponse {
    fn new(code: u16, reply: ApiReply) -> Self {
        Self { code, reply }
    }

    pub fn body(&self) -> String {
        serde_json::to_string(&self.reply)
            .unwrap_or_else(|_| r#"{"status":"error"}"#.to_string())
    }
}

/// Largest request body the handlers read.
pub const MAX_REQUEST_BODY: usize = 2048;

/// Declared `Content-Length` as a buffer size, or `None` when it exceeds
/// [`MAX_REQUEST_BODY`] or the platform's address space.
pub fn request_body_len(declared: Option<u64>) -> Option<usize> {
    usize::try_from(declared.unwrap_or(0))
        .ok()
        .filter(|len| *len <= MAX_REQUEST_BODY)
}

pub fn settings(handle: &DeviceHandle) -> DeviceConfig {
    handle.config()
}

/// Merge a partial JSON update into the working config and persist it.
pub fn save_settings(handle: &DeviceHandle, body: &[u8]) -> ApiResponse {
    let update: DeviceConfigUpdate = match serde_json::from_slice(body) {
        Ok(update) => update,
        Err(err) => {
            warn!("rejecting settings update: {err}");
            return ApiResponse::new(400, ApiReply::error("Invalid JSON"));
        }
    };

    let next = update.apply_to(&handle.config());
    if let Err(reason) = next.validate() {
        return ApiResponse::new(400, ApiReply::error(reason));
    }

    match handle.save_config(next) {
        Ok(()) => ApiResponse::new(200, ApiReply::success("Settings saved. Rebooting...")),
        Err(StoreError::Invalid(reason)) => ApiResponse::new(400, ApiReply::error(reason)),
        Err(err) => {
            warn!("failed to save settings: {err}");
            ApiResponse::new(500, ApiReply::error("Failed to save settings"))
        }
    }
}

pub fn reset_settings(handle: &DeviceHandle) -> ApiResponse {
    match handle.reset_config() {
        Ok(()) => ApiResponse::new(200, ApiReply::success("Settings reset. Rebooting...")),
        Err(err) => {
            warn!("failed to reset settings: {err}");
            ApiResponse::new(500, ApiReply::error("Failed to reset settings"))
        }
    }
}

/// `state` may come from the form body or the query string; the body wins.
pub fn set_locate(handle: &DeviceHandle, form: Option<&str>, query: Option<&str>) -> ApiResponse {
    let (state, source) = match (form, query) {
        (Some(state), _) => (state, "form"),
        (None, Some(state)) => (state, "query"),
        (None, None) => return ApiResponse::new(400, ApiReply::error("Missing state param")),
    };

    let active = parse_flag(state);
    info!("locate set to {active} (from {source})");
    handle.set_locate_active(active);
    ApiResponse::new(200, ApiReply::ok())
}

pub fn restart(handle: &DeviceHandle) -> ApiResponse {
    handle.request_restart();
    ApiResponse::new(200, ApiReply::success("Rebooting..."))
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value, "true" | "1")
}

/// Value of one `%VAR%` placeholder on the index page.
pub fn page_variable(handle: &DeviceHandle, name: &str) -> Option<String> {
    let value = match name {
        "FW_REV" => FIRMWARE_VERSION.to_string(),
        "IP" => handle
            .telemetry()
            .display_address()
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        "HOSTNAME" => handle.telemetry().hostname,
        "SSID" => handle.config().wifi_ssid,
        "MQTT_STATUS" => handle.broker_status().as_str().to_string(),
        "UPTIME" => format_uptime(handle.telemetry().uptime_ms),
        "RSSI" => format_rssi(handle.telemetry().rssi_dbm),
        "FREE_MEMORY" => format_free_memory(handle.telemetry().free_heap_bytes),
        "DATETIME" => format_datetime(handle.telemetry().wall_clock),
        "CAN_STATUS" => "N/A".to_string(),
        "CAN_ID" => handle.config().board_id.to_string(),
        _ => return None,
    };
    Some(value)
}

pub fn render_index(handle: &DeviceHandle, page: &str) -> String {
    template::render(page, |name| page_variable(handle, name))
}
