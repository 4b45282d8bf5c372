//! Bridge settings loaded from `flexbridge.toml`.
//!
//! All settings live under a `[bridge]` table. Every struct is
//! `#[serde(default)]`, so a file only needs the keys it changes:
//!
//! ```toml
//! [bridge.radio]
//! host = "192.168.1.40"
//!
//! [bridge.telemetry]
//! throttle_ms = 2000
//!
//! [[bridge.keys]]
//! id = "encoder-1"
//! description = "Main tuning knob"
//! mode = "rotate_right"
//! ```
//!
//! Without `--config`, the first file that exists and contains a
//! `[bridge]` table is used, searching `./flexbridge.toml` then
//! `/etc/flexbridge/flexbridge.toml`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use flexbridge_core::{Error, Result};
use flexbridge_flex::DeviceMarker;
use flexbridge_flex::client::ClientOptions;

use crate::input::KeyDescriptor;

/// Table name holding the bridge settings.
pub const SECTION_KEY: &str = "bridge";

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "flexbridge.toml";

/// Config file search order when no path is given.
pub fn config_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(CONFIG_FILE_NAME),
        PathBuf::from("/etc/flexbridge").join(CONFIG_FILE_NAME),
    ]
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub radio: RadioConfig,
    pub discovery: DiscoveryConfig,
    pub telemetry: TelemetryConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
    /// Physical key descriptors registered with the input router.
    pub keys: Vec<KeyDescriptor>,
}

/// Command channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Radio address. When unset the radio is discovered on the LAN.
    pub host: Option<String>,
    /// TCP command port.
    pub command_port: u16,
    /// Program name sent to the radio after connecting.
    pub client_name: String,
    /// Slice controlled by the bridge.
    pub slice_index: u8,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Subscribe to slice/transmit/meter status after connecting.
    pub auto_subscribe: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            host: None,
            command_port: 4992,
            client_name: "flexbridge".to_string(),
            slice_index: 0,
            connect_timeout_ms: 5_000,
            auto_subscribe: true,
        }
    }
}

impl RadioConfig {
    /// Command channel options derived from these settings.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            client_name: self.client_name.clone(),
            auto_subscribe: self.auto_subscribe,
            slice_index: self.slice_index,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port the radio announces on.
    pub port: u16,
    /// How long to listen before giving up, in milliseconds.
    pub timeout_ms: u64,
    /// Key of the device-type marker pair.
    pub marker_key: String,
    /// Value of the device-type marker pair.
    pub marker_value: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 4992,
            timeout_ms: 3_000,
            marker_key: "type".to_string(),
            marker_value: "radio".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn marker(&self) -> DeviceMarker {
        DeviceMarker::new(&self.marker_key, &self.marker_value)
    }
}

/// Telemetry stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Local address to bind.
    pub bind_address: String,
    /// Local UDP port; 0 picks a free port.
    pub port: u16,
    /// Minimum interval between accepted readings of one meter, in
    /// milliseconds.
    pub throttle_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 4991,
            throttle_ms: 3_000,
        }
    }
}

impl TelemetryConfig {
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            Error::Config(format!(
                "invalid telemetry bind_address: {}",
                self.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Display surface settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Serve the display protocol at all.
    pub enabled: bool,
    /// Listen address for display clients.
    pub listen: String,
    /// Interval of the periodic push of frequency and meters, in
    /// milliseconds.
    pub push_interval_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:4993".to_string(),
            push_interval_ms: 1_000,
        }
    }
}

impl DisplayConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|_| Error::Config(format!("invalid display listen address: {}", self.listen)))
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load from an explicit path. The file must contain a `[bridge]` table.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        load_section_from_file::<Self>(path, SECTION_KEY)?.ok_or_else(|| {
            Error::Config(format!(
                "{}: missing [{SECTION_KEY}] section",
                path.display()
            ))
        })
    }

    /// Load from `path` if given, otherwise from the first default path that
    /// has a `[bridge]` table. Falls back to defaults when nothing is found.
    ///
    /// Returns the config and the file it came from, if any.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = path {
            return Ok((Self::load_from_file(path)?, Some(path.to_path_buf())));
        }
        for path in config_search_paths() {
            if path.exists() {
                if let Some(cfg) = load_section_from_file::<Self>(&path, SECTION_KEY)? {
                    return Ok((cfg, Some(path)));
                }
            }
        }
        Ok((Self::default(), None))
    }

    /// Parse a whole TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        section_from_table(&table, SECTION_KEY)
            .map(|cfg| cfg.unwrap_or_default())
    }

    /// Render as a TOML document with a `[bridge]` table.
    pub fn to_toml_string(&self) -> Result<String> {
        let mut doc = toml::Table::new();
        let section =
            toml::Value::try_from(self).map_err(|e| Error::Config(e.to_string()))?;
        doc.insert(SECTION_KEY.to_string(), section);
        toml::to_string_pretty(&doc).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Read a file and deserialize one named table from it.
///
/// `Ok(None)` when the table is absent.
fn load_section_from_file<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Option<T>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    section_from_table(&table, key)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

fn section_from_table<T: DeserializeOwned>(table: &toml::Table, key: &str) -> Result<Option<T>> {
    let Some(section) = table.get(key) else {
        return Ok(None);
    };
    // Round-trip through a string so serde defaults apply to the section.
    let section_toml = toml::to_string(section).map_err(|e| Error::Config(e.to_string()))?;
    let cfg = toml::from_str::<T>(&section_toml).map_err(|e| Error::Config(e.to_string()))?;
    Ok(Some(cfg))
}
