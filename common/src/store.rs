use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{info, warn};

use crate::{config::DeviceConfig, error::StoreError};

/// Largest encoded record any store accepts. The NVS back end reads through a
/// buffer of this size plus the terminating NUL.
pub const MAX_RECORD_BYTES: usize = 2048;

/// Durable home of the [`DeviceConfig`] record.
///
/// Implementations never restart the device; that decision belongs to the
/// caller. `save` must replace the record as a unit.
pub trait ConfigStore: Send + Sync {
    /// Persisted record, or defaults when it is missing or unreadable.
    fn load(&self) -> DeviceConfig;

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError>;

    fn reset(&self) -> Result<(), StoreError> {
        self.save(&DeviceConfig::default())
    }
}

/// Parse a persisted blob, degrading to defaults instead of failing boot.
pub fn decode_record(raw: &[u8]) -> DeviceConfig {
    let config = match serde_json::from_slice::<DeviceConfig>(raw) {
        Ok(config) => config,
        Err(err) => {
            warn!("persisted config is malformed ({err}); using defaults");
            return DeviceConfig::default();
        }
    };

    if let Err(reason) = config.validate() {
        warn!("persisted config is invalid ({reason}); using defaults");
        return DeviceConfig::default();
    }

    config
}

pub fn encode_record(config: &DeviceConfig) -> Result<Vec<u8>, StoreError> {
    config.validate().map_err(StoreError::Invalid)?;
    let payload = serde_json::to_vec_pretty(config)?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(StoreError::Invalid("config record exceeds 2048 bytes"));
    }
    Ok(payload)
}

/// JSON file store; writes go to a sibling temp file that is renamed over the
/// record so a torn write never replaces the previous version.
pub struct FileConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "config.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> DeviceConfig {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match fs::read(&self.path) {
            Ok(raw) => decode_record(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no persisted config at {}; using defaults", self.path.display());
                DeviceConfig::default()
            }
            Err(err) => {
                warn!("failed to read {}: {err}; using defaults", self.path.display());
                DeviceConfig::default()
            }
        }
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let payload = encode_record(config)?;
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
