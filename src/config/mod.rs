//! # Configuration Management Module
//!
//! Host-supplied settings for the device core, stored as TOML.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - preferred radio identity and the minimum supported firmware
//! - [`ConnectionConfig`] - connect timeout, strike limit, auto-reconnect and freshness tuning
//! - [`LocationConfig`] - location sharing with the mesh
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     let settings = config.settings()?;
//!     println!("minimum firmware: {}", settings.minimum_firmware);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! preferred_device_id = "6F0E2A4C-61E1-4B5C-9E0A-2D7C5A0B1F33"
//! minimum_firmware_version = "1.3.48"
//!
//! [connection]
//! connect_timeout_ms = 1500
//! max_connect_attempts = 10
//!
//! [location]
//! provide_location = true
//! interval_secs = 900
//!
//! [logging]
//! level = "info"
//! ```

use crate::meshtastic::version::FirmwareVersion;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Transport identity of the radio to reconnect to automatically. Empty means none;
    /// the first radio that connects successfully becomes preferred.
    #[serde(default)]
    pub preferred_device_id: String,
    /// Node number last reported by the preferred radio (0 = unknown).
    #[serde(default)]
    pub preferred_node_num: u32,
    #[serde(default = "default_minimum_firmware_version")]
    pub minimum_firmware_version: String,
}

fn default_minimum_firmware_version() -> String {
    "1.3.48".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            preferred_device_id: String::new(),
            preferred_node_num: 0,
            minimum_firmware_version: default_minimum_firmware_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Period of the connect-attempt timer (ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timer firings without a "connected" event before the attempt is abandoned.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Abandoned runs after which discovery no longer auto-connects to the preferred radio.
    #[serde(default = "default_auto_reconnect_max_runs")]
    pub auto_reconnect_max_runs: u32,
    /// Discovered devices not seen for this long are dropped from the visible list.
    #[serde(default = "default_device_freshness_secs")]
    pub device_freshness_secs: u64,
    /// Pending admin requests without an acknowledgment expire after this long.
    #[serde(default = "default_admin_request_ttl_secs")]
    pub admin_request_ttl_secs: u64,
}

fn default_connect_timeout_ms() -> u64 {
    1500
}

fn default_max_connect_attempts() -> u32 {
    10
}

fn default_auto_reconnect_max_runs() -> u32 {
    2
}

fn default_device_freshness_secs() -> u64 {
    5
}

fn default_admin_request_ttl_secs() -> u64 {
    300
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            auto_reconnect_max_runs: default_auto_reconnect_max_runs(),
            device_freshness_secs: default_device_freshness_secs(),
            admin_request_ttl_secs: default_admin_request_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Share this device's location with the mesh while a session is subscribed.
    #[serde(default)]
    pub provide_location: bool,
    /// Seconds between position reports.
    #[serde(default = "default_location_interval_secs")]
    pub interval_secs: u64,
    /// Fixed coordinates used instead of a live fix when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_altitude: Option<i32>,
}

fn default_location_interval_secs() -> u64 {
    900
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provide_location: false,
            interval_secs: default_location_interval_secs(),
            fixed_latitude: None,
            fixed_longitude: None,
            fixed_altitude: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Validated, typed view of [`Config`] consumed by the device manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub preferred_device_id: Option<String>,
    pub preferred_node_num: u32,
    pub minimum_firmware: FirmwareVersion,
    pub connect_timeout: Duration,
    pub max_connect_attempts: u32,
    pub auto_reconnect_max_runs: u32,
    pub device_freshness: Duration,
    pub admin_request_ttl: Duration,
    pub provide_location: bool,
    pub location_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        // The default config always validates.
        match Config::default().settings() {
            Ok(settings) => settings,
            Err(_) => unreachable!("default configuration is valid"),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Validate and convert into [`ManagerSettings`].
    pub fn settings(&self) -> Result<ManagerSettings> {
        let minimum_firmware = FirmwareVersion::parse(&self.device.minimum_firmware_version)
            .ok_or_else(|| {
                anyhow!(
                    "Invalid minimum_firmware_version '{}'",
                    self.device.minimum_firmware_version
                )
            })?;
        if self.connection.connect_timeout_ms == 0 {
            return Err(anyhow!("connect_timeout_ms must be greater than zero"));
        }
        if self.connection.max_connect_attempts == 0 {
            return Err(anyhow!("max_connect_attempts must be greater than zero"));
        }
        if self.location.interval_secs == 0 {
            return Err(anyhow!("location interval_secs must be greater than zero"));
        }
        let preferred = self.device.preferred_device_id.trim();
        Ok(ManagerSettings {
            preferred_device_id: if preferred.is_empty() {
                None
            } else {
                Some(preferred.to_string())
            },
            preferred_node_num: self.device.preferred_node_num,
            minimum_firmware,
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            max_connect_attempts: self.connection.max_connect_attempts,
            auto_reconnect_max_runs: self.connection.auto_reconnect_max_runs,
            device_freshness: Duration::from_secs(self.connection.device_freshness_secs),
            admin_request_ttl: Duration::from_secs(self.connection.admin_request_ttl_secs),
            provide_location: self.location.provide_location,
            location_interval: Duration::from_secs(self.location.interval_secs),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig::default(),
            connection: ConnectionConfig::default(),
            location: LocationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
