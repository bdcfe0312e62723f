//! Playback target client
//!
//! [`CastConnector`] opens connections, [`CastChannel`] is one open
//! connection. [`PlaybackSession`] drives a channel through
//! connect / launch / load for one session and maps failures to
//! [`SessionError`](crate::error::SessionError)s.

pub mod client;
pub mod frame;
pub mod media;
pub mod playback;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CastError;
use crate::protocol::PlayerStatus;

pub use client::{CastClient, StreamUrls, TlsCastConnector};
pub use frame::CastFrame;
pub use media::MediaInfo;
pub use playback::PlaybackSession;

/// Asynchronous notifications from an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    Status(PlayerStatus),
    /// The connection is gone; no further events follow
    ConnectionLost(String),
}

/// Opens channels to playback targets
#[async_trait]
pub trait CastConnector: Send + Sync {
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn CastChannel>, CastError>;
}

/// One open connection to a playback target
#[async_trait]
pub trait CastChannel: Send {
    /// Launch `app_id` and attach to it
    async fn launch(&mut self, app_id: &str) -> Result<(), CastError>;

    /// Load a live stream with autoplay
    async fn load(&mut self, media: &MediaInfo) -> Result<(), CastError>;

    /// Replace the metadata of the loaded stream
    async fn update_media(&mut self, media: &MediaInfo) -> Result<(), CastError>;

    /// Status and connection-error feed; available once
    fn take_events(&mut self) -> Option<mpsc::Receiver<CastEvent>>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}
