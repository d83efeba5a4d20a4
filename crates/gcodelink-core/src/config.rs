//! Configuration for GCodeLink
//!
//! A single [`AppConfig`] is constructed at process start and handed to the
//! executor and transport server constructors. It can be loaded from TOML
//! or JSON, chosen by file extension.
//!
//! Configuration is organized into sections:
//! - Device settings (variant, port, buffer geometry)
//! - Executor timing and streaming mode
//! - Remote transport (ports, framing, authentication, broadcast)

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Supported device protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Grbl-style text protocol
    #[default]
    Grbl,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grbl => write!(f, "grbl"),
        }
    }
}

/// How program lines are paced against acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Write one line, wait for its ack, then advance
    #[default]
    SendResponse,
    /// Keep writing while the device buffer watermark allows
    CharacterCounting,
}

/// Device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device protocol variant
    pub kind: DeviceKind,
    /// Serial port name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Device receive buffer size in bytes, line terminators included
    pub buffer_capacity: usize,
    /// Fraction of `buffer_capacity` that may be in flight
    pub watermark_ratio: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Grbl,
            port: String::new(),
            baud_rate: 115200,
            buffer_capacity: 127,
            watermark_ratio: 0.90,
        }
    }
}

impl DeviceConfig {
    /// Flow-control threshold in bytes, `capacity * ratio` rounded down
    pub fn watermark(&self) -> usize {
        // absorb representation error so 100 * 0.29 floors to 29, not 28
        (self.buffer_capacity as f64 * self.watermark_ratio + 1e-9).floor() as usize
    }
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Mailbox/channel poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Automatic status query interval in milliseconds, 0 disables
    pub status_poll_interval_ms: u64,
    /// Line pacing strategy
    pub stream_mode: StreamMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            status_poll_interval_ms: 0,
            stream_mode: StreamMode::SendResponse,
        }
    }
}

impl ExecutorConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Status poll interval, if enabled
    pub fn status_poll_interval(&self) -> Option<Duration> {
        (self.status_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.status_poll_interval_ms))
    }
}

/// Remote transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Server name announced in the welcome notification
    pub server_name: String,
    /// Bind host
    pub host: String,
    /// Raw TCP port
    pub port: u16,
    /// WebSocket port, disabled when `None`
    pub ws_port: Option<u16>,
    /// Width of the decimal length header in bytes
    pub header_width: usize,
    /// Accepted WebSocket tokens; empty disables authentication
    pub tokens: Vec<String>,
    /// UDP port for broadcast fan-out, disabled when `None`
    pub udp_broadcast_port: Option<u16>,
    /// Destination address of broadcast datagrams
    pub udp_broadcast_host: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_name: "gcodelink".to_string(),
            host: "0.0.0.0".to_string(),
            port: 61801,
            ws_port: None,
            header_width: 10,
            tokens: Vec::new(),
            udp_broadcast_port: None,
            udp_broadcast_host: "255.255.255.255".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device settings
    pub device: DeviceConfig,
    /// Executor settings
    pub executor: ExecutorConfig,
    /// Remote transport settings
    pub remote: RemoteConfig,
}

impl AppConfig {
    /// Load and validate configuration from a `.toml` or `.json` file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a `.toml` or `.json` file
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            Some("json") => serde_json::to_string_pretty(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.device.buffer_capacity == 0 {
            return Err(ConfigError::ValueOutOfRange {
                key: "device.buffer_capacity".to_string(),
                value: self.device.buffer_capacity.to_string(),
            });
        }
        if !(self.device.watermark_ratio > 0.0 && self.device.watermark_ratio <= 1.0) {
            return Err(ConfigError::ValueOutOfRange {
                key: "device.watermark_ratio".to_string(),
                value: self.device.watermark_ratio.to_string(),
            });
        }
        if self.remote.udp_broadcast_host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::ValueOutOfRange {
                key: "remote.udp_broadcast_host".to_string(),
                value: self.remote.udp_broadcast_host.clone(),
            });
        }
        if !(1..=20).contains(&self.remote.header_width) {
            return Err(ConfigError::ValueOutOfRange {
                key: "remote.header_width".to_string(),
                value: self.remote.header_width.to_string(),
            });
        }
        Ok(())
    }
}
