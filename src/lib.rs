//! # AirPlay to Cast Bridge
//!
//! Makes every Cast device on the LAN appear as an AirPlay receiver.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           BRIDGE ORCHESTRATOR                                │
//! │  ┌───────────────────┐      ┌──────────────────────────────────────────┐    │
//! │  │ Discovery (mDNS)  │─────▶│ Actor: device registry + session registry│    │
//! │  │ _googlecast._tcp  │      └──────────────────┬───────────────────────┘    │
//! │  └───────────────────┘                         │ one session per target     │
//! │                                                ▼                            │
//! │  ┌──────────────────────────────────────────────────────────────────────┐  │
//! │  │ Session "Kitchen Speaker"                                             │  │
//! │  │                                                                       │  │
//! │  │  port lease ──▶ shairport-sync ──PCM fifo──▶ ffmpeg ──MP3──▶ StreamHub │  │
//! │  │                      │                                        │       │  │
//! │  │               metadata fifo                                   │       │  │
//! │  │                      ▼                                        │       │  │
//! │  │               Cast channel (TLS :8009) ◀── LOAD / metadata    │       │  │
//! │  └───────────────────────────────────────────────────────────────┼───────┘  │
//! │                                                                  │          │
//! │  ┌───────────────────────────────────────────────────────────────▼───────┐  │
//! │  │ HTTP server: GET /stream/<id> (audio/mpeg), /api/* status             │  │
//! │  └───────────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//!            ▲ AirPlay from phones                    │ HTTP fetch by device
//!            │                                        ▼
//!      iOS / macOS senders                      Cast devices
//! ```

pub mod cast;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod orchestrator;
pub mod pipe;
pub mod process;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use orchestrator::{BridgeOrchestrator, Collaborators};

/// Application-wide constants
pub mod constants {
    /// mDNS service type of Cast targets
    pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

    /// First port tried for a receiver
    pub const DEFAULT_RECEIVER_PORT: u16 = 5000;

    /// Ports tried before giving up
    pub const DEFAULT_PORT_ATTEMPTS: u16 = 10;

    /// Transcoder audio codec
    pub const DEFAULT_CODEC: &str = "libmp3lame";

    pub const DEFAULT_BITRATE: &str = "192k";

    /// Receiver PCM output rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default Media Receiver application
    pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

    /// Port of the stream and status server
    pub const DEFAULT_HTTP_PORT: u16 = 8090;
}
