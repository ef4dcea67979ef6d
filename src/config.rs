//! Configuration management for the frame relay

use crate::capture::{PixelFormat, VideoFormat};
use crate::transmit::{SendFailurePolicy, TransmitterOptions, MAX_UDP_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted frame width or height in pixels
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Statistics reporting interval (seconds, 0 = off)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Video source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `"generator"` for the built-in test pattern, otherwise a V4L2 device path
    #[serde(default = "default_device")]
    pub device: String,

    /// Four-character pixel encoding, e.g. "RGBP" (RGB565) or "YUYV"
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Requested bytes per row (0 = device decides)
    #[serde(default)]
    pub pitch: u32,

    /// Generator frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Dequeue timeout in milliseconds; absent waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dequeue_timeout_ms: Option<u64>,
}

/// Frame buffer pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on buffer memory in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<usize>,
}

/// Destination and channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Destination IPv4 address
    #[serde(default = "default_dest_host")]
    pub dest_host: String,

    /// Destination UDP port
    #[serde(default = "default_dest_port")]
    pub dest_port: u16,

    /// Local port (0 = auto-assign)
    #[serde(default)]
    pub local_port: u16,

    /// Largest payload offered per send
    #[serde(default = "default_max_datagram")]
    pub max_datagram_size: usize,

    /// Non-blocking socket; busy sends are retried
    #[serde(default = "default_true")]
    pub nonblocking: bool,

    /// "drop-frames", "reconnect" or "abort"
    #[serde(default)]
    pub on_send_failure: SendFailurePolicy,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stats_interval_seconds: default_stats_interval(),
            source: SourceConfig::default(),
            pool: PoolConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            pixel_format: default_pixel_format(),
            width: default_width(),
            height: default_height(),
            pitch: 0,
            fps: default_fps(),
            dequeue_timeout_ms: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dest_host: default_dest_host(),
            dest_port: default_dest_port(),
            local_port: 0,
            max_datagram_size: default_max_datagram(),
            nonblocking: true,
            on_send_failure: SendFailurePolicy::default(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff(),
        }
    }
}

// Default value functions
fn default_stats_interval() -> u64 {
    10
}
fn default_device() -> String {
    crate::capture::GENERATOR_DEVICE.to_string()
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::RGB565
}
fn default_width() -> u32 {
    160
}
fn default_height() -> u32 {
    80
}
fn default_fps() -> u32 {
    30
}
fn default_dest_host() -> String {
    "127.0.0.1".to_string()
}
fn default_dest_port() -> u16 {
    5000
}
fn default_max_datagram() -> usize {
    MAX_UDP_PAYLOAD
}
fn default_true() -> bool {
    true
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_backoff() -> u64 {
    500
}

impl SourceConfig {
    /// The format asked of the device
    pub fn requested_format(&self) -> VideoFormat {
        VideoFormat::new(self.pixel_format, self.width, self.height, self.pitch)
    }

    pub fn dequeue_timeout(&self) -> Option<Duration> {
        self.dequeue_timeout_ms.map(Duration::from_millis)
    }
}

impl NetworkConfig {
    /// Resolves the fixed destination endpoint
    pub fn destination(&self) -> Result<SocketAddr, ConfigError> {
        let ip: Ipv4Addr = self.dest_host.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "dest_host must be an IPv4 address, got {:?}: {}",
                self.dest_host, e
            ))
        })?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.dest_port)))
    }

    pub fn transmitter_options(&self) -> TransmitterOptions {
        TransmitterOptions {
            max_datagram_size: self.max_datagram_size,
            policy: self.on_send_failure,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let source = &self.source;

        if source.device.trim().is_empty() {
            return Err(ConfigError::Invalid("source.device must not be empty".into()));
        }

        if source.width == 0 || source.height == 0 {
            return Err(ConfigError::Invalid(
                "source: width and height must be > 0".into(),
            ));
        }

        if source.width > MAX_DIMENSION || source.height > MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "source: {}x{} exceeds the {} pixel limit",
                source.width, source.height, MAX_DIMENSION
            )));
        }

        if source.fps == 0 || source.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "source: FPS must be between 1 and 120, got {}",
                source.fps
            )));
        }

        let net = &self.network;

        if net.dest_port == 0 {
            return Err(ConfigError::Invalid("network: dest_port must be > 0".into()));
        }

        net.destination()?;

        if net.max_datagram_size == 0 || net.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "network: max_datagram_size must be between 1 and {}, got {}",
                MAX_UDP_PAYLOAD, net.max_datagram_size
            )));
        }

        if net.on_send_failure == SendFailurePolicy::Reconnect && net.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "network: reconnect policy needs reconnect_attempts > 0".into(),
            ));
        }

        if let Some(limit) = self.pool.memory_limit_bytes {
            if limit == 0 {
                return Err(ConfigError::Invalid(
                    "pool: memory_limit_bytes must be > 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
