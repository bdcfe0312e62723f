//! Application configuration
//!
//! Loaded from TOML. Every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoveryConfig,
    pub ports: PortConfig,
    pub receiver: ReceiverSettings,
    pub relay: RelayConfig,
    pub cast: CastConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// mDNS service type of playback targets
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: CAST_SERVICE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub start: u16,
    pub max_tries: u16,
    pub probe_timeout_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_RECEIVER_PORT,
            max_tries: DEFAULT_PORT_ATTEMPTS,
            probe_timeout_ms: 500,
        }
    }
}

impl PortConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Receiver subprocess settings shared by every session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    /// Where per-session receiver config files are written
    pub config_dir: PathBuf,
    /// Where per-session named pipes are created
    pub pipe_dir: PathBuf,
    /// `{device}` is replaced with the target name
    pub name_template: String,
    pub ready_timeout_ms: u64,
    /// Log substring that marks the receiver as ready
    pub ready_line: Option<String>,
    /// Treat a successful TCP connect to the receiver port as ready
    pub probe_port: bool,
    pub kill_stale_on_start: bool,
    pub stop_grace_ms: u64,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("shairport-sync"),
            extra_args: Vec::new(),
            config_dir: std::env::temp_dir(),
            pipe_dir: PathBuf::from("/tmp"),
            name_template: "AirPlay to {device}".to_string(),
            ready_timeout_ms: 5000,
            ready_line: None,
            probe_port: true,
            kill_stale_on_start: true,
            stop_grace_ms: 2000,
        }
    }
}

impl ReceiverSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Receiver name advertised for a target
    pub fn receiver_name(&self, device_name: &str) -> String {
        self.name_template.replace("{device}", device_name)
    }
}

/// Transcoding relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ffmpeg_binary: PathBuf,
    pub codec: String,
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Read size for transcoder output, in bytes
    pub chunk_size: usize,
    pub restart_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: PathBuf::from("ffmpeg"),
            codec: DEFAULT_CODEC.to_string(),
            bitrate: DEFAULT_BITRATE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: 4096,
            restart_delay_ms: 500,
        }
    }
}

impl RelayConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Receiver application launched on the target
    pub app_id: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub content_type: String,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_MEDIA_RECEIVER_APP_ID.to_string(),
            connect_timeout_ms: 6000,
            request_timeout_ms: 8000,
            heartbeat_interval_ms: 5000,
            content_type: "audio/mp3".to_string(),
        }
    }
}

impl CastConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    /// Address targets use to reach the stream server; detected per target when unset
    pub advertise_address: Option<String>,
    /// Chunks buffered per stream before slow listeners start skipping
    pub stream_buffer_chunks: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            advertise_address: None,
            stream_buffer_chunks: 64,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "airplay-cast-bridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.max_tries == 0 {
            return Err(Error::Config("ports.max_tries must be > 0".into()));
        }
        if self.receiver.ready_timeout_ms == 0 {
            return Err(Error::Config("receiver.ready_timeout_ms must be > 0".into()));
        }
        if self.cast.connect_timeout_ms == 0 || self.cast.request_timeout_ms == 0 {
            return Err(Error::Config("cast timeouts must be > 0".into()));
        }
        if !(1..=2).contains(&self.relay.channels) {
            return Err(Error::Config(format!(
                "relay.channels must be 1 or 2, got {}",
                self.relay.channels
            )));
        }
        if self.relay.chunk_size == 0 || self.http.stream_buffer_chunks == 0 {
            return Err(Error::Config("relay.chunk_size and http.stream_buffer_chunks must be > 0".into()));
        }
        Ok(())
    }
}
