use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::models::MeterEndpoint;

const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Storage is not mounted")]
    NotMounted,
    #[error("Unable to prepare storage at {0}: {1}")]
    Mount(String, std::io::Error),
    #[error("Unable to write config: {0}")]
    Write(#[from] std::io::Error),
    #[error("Unable to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct WifiConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub ap_mode: bool,
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_device_id_default() -> String { return "energymeter".to_string() }
fn mqtt_interval_default() -> u64 { return 300 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default="mqtt_device_id_default")]
    pub device_id: String,
    /// Seconds between two polling sweeps
    #[serde(default="mqtt_interval_default")]
    pub interval: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        return MqttConfig {
            server: String::new(),
            port: mqtt_port_default(),
            device_id: mqtt_device_id_default(),
            interval: mqtt_interval_default(),
        };
    }
}

/// How the transceiver is switched between transmit and receive
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DirectionConfig {
    /// RTS line of the UART drives DE/RE
    Rts,
    /// sysfs GPIO number driving DE/RE
    Gpio(u32),
}

fn bus_port_default() -> String { return "/dev/ttyS1".to_string() }
fn bus_baud_rate_default() -> u32 { return 9600 }
fn bus_response_timeout_default() -> u64 { return 1000 }
fn bus_direction_default() -> DirectionConfig { return DirectionConfig::Rts }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BusConfig {
    #[serde(default="bus_port_default")]
    pub port: String,
    #[serde(default="bus_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="bus_response_timeout_default")]
    pub response_timeout_ms: u64,
    #[serde(default="bus_direction_default")]
    pub direction: DirectionConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        return BusConfig {
            port: bus_port_default(),
            baud_rate: bus_baud_rate_default(),
            response_timeout_ms: bus_response_timeout_default(),
            direction: bus_direction_default(),
        };
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub issuer_url: Option<String>,
}

fn api_enabled_default() -> bool { return true }
fn api_port_default() -> u16 { return 80 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ApiConfig {
    #[serde(default="api_enabled_default")]
    pub enabled: bool,
    #[serde(default="api_port_default")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        return ApiConfig { enabled: api_enabled_default(), port: api_port_default() };
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub meters: Vec<MeterEndpoint>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Settings of a device that never stored a configuration, it comes up as hotspot
    pub fn factory() -> Self {
        let mut config = Config::default();
        config.wifi.ap_mode = true;
        config.mqtt.interval = 60;
        return config;
    }

    /// Base url of the certificate issuer, the broker host is assumed when none is set
    pub fn issuer_url(&self) -> String {
        match &self.provisioning.issuer_url {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:3000", self.mqtt.server),
        }
    }
}

/// Persistence of the configuration document
pub struct ConfigStore {
    root: Option<PathBuf>,
}

impl ConfigStore {
    pub fn open(dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Mount(dir.display().to_string(), e))?;
        return Ok(ConfigStore { root: Some(dir.to_path_buf()) });
    }

    /// A store without backing storage, loads defaults and refuses to save
    pub fn unmounted() -> Self {
        return ConfigStore { root: None };
    }

    fn path(&self) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join(CONFIG_FILE))
    }

    /// Never fails, a missing or broken document is replaced by defaults
    pub fn load(&self) -> Config {
        let path = match self.path() {
            Some(p) => p,
            None => {
                error!("No storage available, running on defaults");
                return Config::default();
            }
        };

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Config {} not found, creating factory defaults", path.display());
                let config = Config::factory();
                if let Err(e) = self.save(&config) {
                    warn!("Unable to store factory defaults: {e}");
                }
                return config;
            }
            Err(e) => {
                warn!("Unable to read config {}: {e}", path.display());
                return Config::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(c) => {
                debug!("Config loaded from {}", path.display());
                c
            }
            Err(e) => {
                warn!("Config {} is corrupt ({e}), using defaults", path.display());
                Config::default()
            }
        }
    }

    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let path = self.path().ok_or(ConfigError::NotMounted)?;
        let tmp = path.with_extension("json.tmp");

        let x = serde_json::to_string_pretty(config)?;
        fs::write(&tmp, x.as_bytes())?;
        fs::rename(&tmp, &path)?;
        info!("New Config written");
        return Ok(());
    }

    /// Deletes the document, the next boot starts from factory defaults
    pub fn reset(&self) -> Result<(), ConfigError> {
        let path = self.path().ok_or(ConfigError::NotMounted)?;
        match fs::remove_file(&path) {
            Ok(()) => { info!("Config reset, file deleted"); Ok(()) }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Owner of the in-memory configuration.
///
/// Every reader works on an immutable snapshot, writers replace the whole
/// snapshot so a reader never observes a half written configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (sender, _) = watch::channel(Arc::new(config));
        return ConfigHandle { sender: Arc::new(sender) };
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }

    pub fn replace(&self, config: Config) {
        self.sender.send_replace(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_document_creates_factory_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        let config = store.load();
        assert!(config.wifi.ap_mode);
        assert_eq!(config.mqtt.interval, 60);
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_corrupt_document_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn test_partial_document_gets_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "wifi": { "ssid": "home" }, "mqtt": { "server": "broker.local" },
                 "meters": [ { "id": 2, "modbus_id": 10, "name": "Kitnet 101" } ] }"#,
        ).unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        let config = store.load();
        assert_eq!(config.wifi.ssid, "home");
        assert!(!config.wifi.ap_mode);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.interval, 300);
        assert_eq!(config.meters[0].channel_index, 2);
        assert_eq!(config.bus.direction, DirectionConfig::Rts);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        let mut config = Config::default();
        config.mqtt.server = "broker.example".to_string();
        config.bus.direction = DirectionConfig::Gpio(4);
        store.save(&config).unwrap();

        assert_eq!(store.load(), config);
    }

    #[test]
    fn test_reset_removes_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.save(&Config::default()).unwrap();

        store.reset().unwrap();
        assert!(!dir.path().join(CONFIG_FILE).exists());
        store.reset().unwrap();
    }

    #[test]
    fn test_unmounted_store() {
        let store = ConfigStore::unmounted();
        assert_eq!(store.load(), Config::default());
        assert!(matches!(store.save(&Config::default()), Err(ConfigError::NotMounted)));
    }

    #[test]
    fn test_issuer_url() {
        let mut config = Config::default();
        config.mqtt.server = "10.0.0.5".to_string();
        assert_eq!(config.issuer_url(), "http://10.0.0.5:3000");

        config.provisioning.issuer_url = Some("https://pki.example/".to_string());
        assert_eq!(config.issuer_url(), "https://pki.example");
    }

    #[test]
    fn test_snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();

        let mut next = Config::default();
        next.mqtt.server = "other".to_string();
        handle.replace(next);

        assert_eq!(before.mqtt.server, "");
        assert_eq!(handle.snapshot().mqtt.server, "other");
    }
}
