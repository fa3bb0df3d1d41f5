//! Agent configuration
//!
//! Loaded once at startup from a TOML file and never changed afterwards. Any
//! problem here is fatal: the agent refuses to start rather than run with a
//! half-understood configuration.
//!
//! ```toml
//! [global]
//! broker = "localhost"
//! port = 1883
//! username = ""
//! password = ""
//! topic_root = "devices"
//! device_name = "kitchen"
//! reconnect_delay = 5
//! publish_delay = 3
//! full_publish_cycle = 20
//!
//! [bh1750]
//! i2c_bus = 1
//! i2c_addr = 0x23
//! mode = 0x20
//!
//! [ha_discover]
//! enabled = false
//! base = "homeassistant"
//! device_name = ""
//!
//! [logging]
//! level = "info"
//! path = "log"
//! file = ""
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

pub const CONFIG_FILE: &str = "mqtt-lux-bridge.toml";
const CONFIG_DIR: &str = "mqtt-lux-bridge";
const USER_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Error while reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error while parsing config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub bh1750: Bh1750Config,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ha_discover: HaDiscoverConfig,
}

/// Broker connection and publish cadence
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GlobalConfig {
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty means anonymous
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub topic_root: String,
    pub device_name: String,
    /// Defaults to `<device_name>-<pid>`
    #[serde(default)]
    pub client_id: Option<String>,
    /// Seconds between connection attempts
    pub reconnect_delay: u64,
    /// Seconds between publish sweeps
    pub publish_delay: u64,
    /// Sweeps between forced full publishes
    pub full_publish_cycle: u32,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

impl GlobalConfig {
    /// `<topic_root>/<device_name>`
    pub fn device_topic_root(&self) -> String {
        format!("{}/{}", self.topic_root, self.device_name)
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.device_name, std::process::id()))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn publish_delay(&self) -> Duration {
        Duration::from_secs(self.publish_delay)
    }

    /// Username/password pair, `None` for anonymous access
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }
}

/// BH1750 light sensor wiring
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Bh1750Config {
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    pub i2c_addr: u16,
    pub mode: u8,
}

/// Home Assistant MQTT discovery
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HaDiscoverConfig {
    /// Disabled still publishes, with empty payloads that remove the entities
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_discovery_base")]
    pub base: String,
    /// Name shown in Home Assistant; empty uses `global.device_name`
    #[serde(default)]
    pub device_name: String,
}

impl Default for HaDiscoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base: default_discovery_base(),
            device_name: String::new(),
        }
    }
}

impl HaDiscoverConfig {
    pub fn display_name<'a>(&'a self, global: &'a GlobalConfig) -> &'a str {
        match self.device_name.trim() {
            "" => global.device_name.as_str(),
            name => name,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Log file name inside `path`; empty logs to stdout only
    #[serde(default)]
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            path: default_log_path(),
            file: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" | "warning" => Ok(Level::WARN),
            "error" | "critical" => Ok(Level::ERROR),
            other => Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{other}'"),
            )),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        let name = self.file.trim();
        (!name.is_empty()).then_some(name)
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_discovery_base() -> String {
    "homeassistant".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("log")
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let global = &self.global;
        if global.broker.trim().is_empty() {
            return Err(ConfigError::invalid("global.broker", "must not be empty"));
        }
        check_topic_part("global.topic_root", &global.topic_root, true)?;
        check_topic_part("global.device_name", &global.device_name, false)?;
        if let Some(id) = &global.client_id {
            if id.is_empty() || id.starts_with(' ') {
                return Err(ConfigError::invalid(
                    "global.client_id",
                    "must not be empty or start with a space",
                ));
            }
        }
        if global.reconnect_delay < 1 {
            return Err(ConfigError::invalid(
                "global.reconnect_delay",
                "must be at least 1 second",
            ));
        }
        if global.publish_delay < 1 {
            return Err(ConfigError::invalid(
                "global.publish_delay",
                "must be at least 1 second",
            ));
        }
        if self.bh1750.i2c_addr > 0x7f {
            return Err(ConfigError::invalid(
                "bh1750.i2c_addr",
                format!("{:#x} is not a 7-bit address", self.bh1750.i2c_addr),
            ));
        }
        if !crate::sensor::bh1750::MODES.contains(&self.bh1750.mode) {
            return Err(ConfigError::invalid(
                "bh1750.mode",
                format!("{:#04x} is not a measurement mode", self.bh1750.mode),
            ));
        }
        check_topic_part("ha_discover.base", &self.ha_discover.base, true)?;
        self.logging.level()?;
        Ok(())
    }
}

/// Topic fragments may not carry wildcards or empty levels. The root may
/// span several levels, the device name is exactly one.
fn check_topic_part(
    field: &'static str,
    value: &str,
    multi_level: bool,
) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if value.contains(['+', '#']) {
        return Err(ConfigError::invalid(field, "must not contain MQTT wildcards"));
    }
    if !multi_level && value.contains('/') {
        return Err(ConfigError::invalid(field, "must be a single topic level"));
    }
    if value.split('/').any(str::is_empty) {
        return Err(ConfigError::invalid(field, "must not contain empty topic levels"));
    }
    Ok(())
}

/// Config file used when none is given on the command line: the working
/// directory first, then the user config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    match dirs::config_dir() {
        Some(mut dir) => {
            dir.push(CONFIG_DIR);
            dir.push(USER_CONFIG_FILE);
            dir
        }
        None => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[global]
broker = "broker.local"
port = 1884
username = ""
password = ""
topic_root = "devices"
device_name = "kitchen"
reconnect_delay = 5
publish_delay = 3
full_publish_cycle = 2

[bh1750]
i2c_addr = 0x23
mode = 0x20
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.global.port, 1884);
        assert_eq!(config.global.device_topic_root(), "devices/kitchen");
        assert_eq!(config.global.credentials(), None);
        assert_eq!(config.global.keep_alive, 60);
        assert_eq!(config.global.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.bh1750.i2c_bus, 1);
        assert_eq!(config.bh1750.i2c_addr, 0x23);
        assert_eq!(config.bh1750.mode, 0x20);
        assert_eq!(config.logging.level().unwrap(), Level::INFO);
        assert_eq!(config.logging.file_name(), None);
    }

    #[test]
    fn credentials_present_when_username_set() {
        let content = SAMPLE
            .replace("username = \"\"", "username = \"agent\"")
            .replace("password = \"\"", "password = \"secret\"");
        let config = AppConfig::from_toml(&content).unwrap();
        assert_eq!(
            config.global.credentials(),
            Some(("agent".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let content = SAMPLE.replace("broker = \"broker.local\"\n", "");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_delays_are_rejected() {
        let content = SAMPLE.replace("publish_delay = 3", "publish_delay = 0");
        match AppConfig::from_toml(&content) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "global.publish_delay"),
            other => panic!("unexpected result: {other:?}"),
        }

        let content = SAMPLE.replace("reconnect_delay = 5", "reconnect_delay = 0");
        match AppConfig::from_toml(&content) {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "global.reconnect_delay")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn device_name_must_be_single_level() {
        let content = SAMPLE.replace("device_name = \"kitchen\"", "device_name = \"a/b\"");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Invalid { field: "global.device_name", .. })
        ));

        let content = SAMPLE.replace("topic_root = \"devices\"", "topic_root = \"home/+\"");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Invalid { field: "global.topic_root", .. })
        ));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let content = format!("{SAMPLE}\n[logging]\nlevel = \"loud\"\n");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Invalid { field: "logging.level", .. })
        ));
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = AppConfig::from_toml(include_str!("../config/mqtt-lux-bridge.toml")).unwrap();
        assert_eq!(config.bh1750.i2c_addr, 0x23);
        assert_eq!(config.bh1750.mode, 0x10);
        assert_eq!(config.global.device_topic_root(), "devices/kitchen");
        assert_eq!(config.global.credentials(), None);
        assert_eq!(config.logging.file_name(), None);
    }

    #[test]
    fn unsupported_sensor_mode_is_rejected() {
        let content = SAMPLE.replace("mode = 0x20", "mode = 0x42");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Invalid { field: "bh1750.mode", .. })
        ));
    }

    #[test]
    fn discovery_defaults_to_disabled() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert!(!config.ha_discover.enabled);
        assert_eq!(config.ha_discover.base, "homeassistant");
        assert_eq!(config.ha_discover.display_name(&config.global), "kitchen");
    }

    #[test]
    fn discovery_section_is_read() {
        let content = format!(
            "{SAMPLE}\n[ha_discover]\nenabled = true\nbase = \"ha\"\n\
             device_name = \"Kitchen display\"\n"
        );
        let config = AppConfig::from_toml(&content).unwrap();
        assert!(config.ha_discover.enabled);
        assert_eq!(config.ha_discover.base, "ha");
        assert_eq!(config.ha_discover.display_name(&config.global), "Kitchen display");

        let content = format!("{SAMPLE}\n[ha_discover]\nbase = \"ha/#\"\n");
        assert!(matches!(
            AppConfig::from_toml(&content),
            Err(ConfigError::Invalid { field: "ha_discover.base", .. })
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.global.broker, "broker.local");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::NotFound(_))));
    }
}
