//! Transcoder invocation

use std::path::{Path, PathBuf};

use crate::config::RelayConfig;
use crate::process::ProcessSpec;

/// Raw PCM in, MP3 out on stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeConfig {
    pub binary: PathBuf,
    pub codec: String,
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl TranscodeConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            binary: config.ffmpeg_binary.clone(),
            codec: config.codec.clone(),
            bitrate: config.bitrate.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    /// Command reading signed 16-bit little-endian PCM from `input`
    pub fn process_spec(&self, input: &Path) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-f", "s16le"])
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("-ac")
            .arg(self.channels.to_string())
            .arg("-i")
            .arg(input.display().to_string())
            .arg("-acodec")
            .arg(self.codec.as_str())
            .arg("-b:a")
            .arg(self.bitrate.as_str())
            .args(["-f", "mp3", "pipe:1"])
    }
}
