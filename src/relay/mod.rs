//! Transcoding relay between a receiver's audio pipe and a live stream

pub mod hub;
pub mod stream_relay;
pub mod transcoder;

pub use hub::{LivePublisher, StreamHub};
pub use stream_relay::{RelayEvent, StreamRelay};
pub use transcoder::TranscodeConfig;

/// Stream id a session publishes under
pub fn stream_id_for(device_name: &str) -> String {
    format!("bridge-stream-{}", device_name)
}
