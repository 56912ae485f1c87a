use serde::{Deserialize, Serialize};

/// Passphrase written by the long-press reset; matches the fallback AP so an
/// operator can always rejoin the device locally.
pub const FACTORY_RESET_WIFI_PASSWORD: &str = "password";

pub const FALLBACK_AP_SSID: &str = "HSC-Setup";
pub const FALLBACK_AP_PASSWORD: &str = "password";

pub const DEVICE_NAME_PREFIX: &str = "HSC-Device-";

const MAX_SSID_BYTES: usize = 32;
const MAX_PASSPHRASE_BYTES: usize = 64;

/// Persisted identity and credential record.
///
/// Every field is required on deserialization: a truncated record must fail to
/// parse instead of being merged with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_server: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    pub board_id: u32,
    pub location: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("HSC_WIFI_SSID").unwrap_or("LocoNet").to_string(),
            wifi_password: option_env!("HSC_WIFI_PASS")
                .unwrap_or("MyTrainRoom")
                .to_string(),
            mqtt_server: option_env!("HSC_MQTT_HOST")
                .unwrap_or("mqtt.internal")
                .to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            board_id: 0,
            location: String::new(),
        }
    }
}

impl DeviceConfig {
    /// Board id `0` is reserved for a device that has not been set up yet.
    pub fn is_configured(&self) -> bool {
        self.board_id != 0
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    /// Name used both as the broker client id and in the announcement.
    pub fn device_name(&self) -> String {
        format!("{DEVICE_NAME_PREFIX}{}", self.board_id)
    }

    pub fn client_id(&self) -> String {
        self.device_name()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.wifi_ssid.trim().is_empty() {
            return Err("wifi_ssid cannot be empty");
        }
        if self.wifi_ssid.len() > MAX_SSID_BYTES {
            return Err("wifi_ssid must be at most 32 bytes");
        }
        if self.wifi_password.len() > MAX_PASSPHRASE_BYTES {
            return Err("wifi_password must be at most 64 bytes");
        }
        if self.mqtt_server.trim().is_empty() {
            return Err("mqtt_server cannot be empty");
        }
        if self.mqtt_port == 0 {
            return Err("mqtt_port must be between 1 and 65535");
        }
        Ok(())
    }

    /// Copy of this config with only the station passphrase replaced.
    pub fn with_factory_wifi_password(&self) -> Self {
        Self {
            wifi_password: FACTORY_RESET_WIFI_PASSWORD.to_string(),
            ..self.clone()
        }
    }
}

/// Partial settings update; absent fields keep the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigUpdate {
    #[serde(default)]
    pub wifi_ssid: Option<String>,
    #[serde(default)]
    pub wifi_password: Option<String>,
    #[serde(default)]
    pub mqtt_server: Option<String>,
    #[serde(default)]
    pub mqtt_port: Option<u16>,
    #[serde(default)]
    pub mqtt_user: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default)]
    pub board_id: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
}

impl DeviceConfigUpdate {
    pub fn apply_to(self, current: &DeviceConfig) -> DeviceConfig {
        DeviceConfig {
            wifi_ssid: self.wifi_ssid.unwrap_or_else(|| current.wifi_ssid.clone()),
            wifi_password: self
                .wifi_password
                .unwrap_or_else(|| current.wifi_password.clone()),
            mqtt_server: self
                .mqtt_server
                .unwrap_or_else(|| current.mqtt_server.clone()),
            mqtt_port: self.mqtt_port.unwrap_or(current.mqtt_port),
            mqtt_user: self.mqtt_user.unwrap_or_else(|| current.mqtt_user.clone()),
            mqtt_password: self
                .mqtt_password
                .unwrap_or_else(|| current.mqtt_password.clone()),
            board_id: self.board_id.unwrap_or(current.board_id),
            location: self.location.unwrap_or_else(|| current.location.clone()),
        }
    }
}
