//! Client configuration
//!
//! Loaded from TOML. Every field has a default so a partial file (or no
//! file at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::device::DeviceSelector;
use crate::audio::AudioFormat;
use crate::constants::*;
use crate::error::ConfigError;
use crate::protocol::SubProtocol;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
}

/// Relay endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket address of the relay
    pub url: String,
    /// Wire format spoken by the relay
    pub protocol: SubProtocol,
    /// Fixed participant id; generated when absent
    pub participant_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            protocol: SubProtocol::default(),
            participant_id: None,
        }
    }
}

/// Connection supervision timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How often the supervisor checks connection state
    pub poll_interval_ms: u64,
    /// Delay after a failed connect before the next attempt
    pub retry_backoff_ms: u64,
    /// Maximum wait for the handshake answer
    pub handshake_timeout_ms: u64,
    /// Keep-alive period on sub-protocols that need one
    pub keepalive_interval_ms: u64,
    /// Outbound frames queued before sends start failing
    pub outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Capture and playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Per-speaker playback buffer length
    pub jitter_buffer_ms: u32,
    /// Speakers silent for longer than this lose their playback channel
    pub idle_timeout_secs: u64,
    /// How often idle speakers are reaped
    pub reap_interval_secs: u64,
    pub input_device: DeviceSelector,
    pub output_device: DeviceSelector,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            jitter_buffer_ms: DEFAULT_JITTER_BUFFER_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
            input_device: DeviceSelector::Default,
            output_device: DeviceSelector::Default,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn jitter_buffer(&self) -> Duration {
        Duration::from_millis(u64::from(self.jitter_buffer_ms))
    }
}

impl ClientConfig {
    /// Platform config file location (`<config dir>/voice-relay/config.toml`)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("", "", "voice-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from the default location, falling back to defaults if the file
    /// is missing
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
