//! One session's connection to its playback target

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cast::{CastChannel, CastConnector, CastEvent, MediaInfo};
use crate::config::CastConfig;
use crate::error::{CastError, SessionError};
use crate::protocol::TrackMetadata;

pub struct PlaybackSession {
    device_name: String,
    connector: Arc<dyn CastConnector>,
    config: CastConfig,
    channel: Option<Box<dyn CastChannel>>,
    launched: bool,
    media: Option<MediaInfo>,
}

impl PlaybackSession {
    pub fn new(device_name: impl Into<String>, connector: Arc<dyn CastConnector>, config: CastConfig) -> Self {
        Self {
            device_name: device_name.into(),
            connector,
            config,
            channel: None,
            launched: false,
            media: None,
        }
    }

    /// Title shown until the source sends metadata
    pub fn default_title(&self) -> String {
        format!("AirPlay Stream to {}", self.device_name)
    }

    pub fn has_client(&self) -> bool {
        self.channel.is_some()
    }

    pub fn has_player(&self) -> bool {
        self.launched
    }

    pub fn is_loaded(&self) -> bool {
        self.media.is_some()
    }

    pub async fn connect(&mut self, address: &str, port: u16) -> Result<(), SessionError> {
        tracing::info!("Connecting to {} at {}:{}", self.device_name, address, port);
        let channel = bounded(self.config.connect_timeout(), self.connector.connect(address, port))
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        self.channel = Some(channel);
        Ok(())
    }

    /// Start the default media receiver application on the target
    pub async fn launch_receiver_app(&mut self) -> Result<(), SessionError> {
        let timeout = self.config.request_timeout();
        let app_id = self.config.app_id.clone();
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| SessionError::LaunchFailed("not connected".into()))?;
        bounded(timeout, channel.launch(&app_id))
            .await
            .map_err(|e| SessionError::LaunchFailed(e.to_string()))?;
        self.launched = true;
        Ok(())
    }

    /// Load `stream_id` as a live stream and start playing
    pub async fn load_stream(&mut self, stream_id: &str, mime_type: &str) -> Result<(), SessionError> {
        let timeout = self.config.request_timeout();
        let media = MediaInfo::live(stream_id, mime_type).with_metadata(TrackMetadata {
            title: Some(self.default_title()),
            artist: None,
            album: None,
        });
        if !self.launched {
            return Err(SessionError::LoadFailed("receiver application not launched".into()));
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| SessionError::LoadFailed("not connected".into()))?;
        bounded(timeout, channel.load(&media))
            .await
            .map_err(|e| SessionError::LoadFailed(e.to_string()))?;
        tracing::info!("Loaded {} on {}", stream_id, self.device_name);
        self.media = Some(media);
        Ok(())
    }

    /// Push now-playing metadata. Best-effort; the stream keeps playing on error.
    ///
    /// The update is sent as a fresh LOAD of the same live stream, so the
    /// target may drop a moment of audio while it reconnects. Metadata equal
    /// to what is already shown is not resent.
    pub async fn update_metadata(&mut self, metadata: &TrackMetadata) -> Result<(), SessionError> {
        let timeout = self.config.request_timeout();
        let mut metadata = metadata.clone();
        if metadata.title.as_deref().map_or(true, str::is_empty) {
            metadata.title = Some(self.default_title());
        }

        let (channel, current) = match (self.channel.as_mut(), self.media.as_ref()) {
            (Some(channel), Some(current)) => (channel, current),
            _ => return Err(SessionError::MetadataPushFailed("no stream loaded".into())),
        };
        if current.metadata == metadata {
            return Ok(());
        }
        let media = current.clone().with_metadata(metadata);
        bounded(timeout, channel.update_media(&media))
            .await
            .map_err(|e| SessionError::MetadataPushFailed(e.to_string()))?;
        self.media = Some(media);
        Ok(())
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CastEvent>> {
        self.channel.as_mut().and_then(|channel| channel.take_events())
    }

    /// Close the connection. Returns `true` only on the call that closed it.
    pub async fn close(&mut self) -> bool {
        match self.channel.take() {
            Some(mut channel) => {
                channel.close().await;
                self.launched = false;
                self.media = None;
                tracing::debug!("Closed cast connection to {}", self.device_name);
                true
            }
            None => false,
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    operation: impl std::future::Future<Output = Result<T, CastError>>,
) -> Result<T, CastError> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| CastError::Timeout(format!("no answer within {:?}", timeout)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCast;

    fn session(cast: &FakeCast) -> PlaybackSession {
        PlaybackSession::new("Den", Arc::new(cast.clone()), CastConfig::default())
    }

    #[tokio::test]
    async fn test_full_setup() {
        let cast = FakeCast::new();
        let mut playback = session(&cast);

        playback.connect("10.0.0.5", 8009).await.unwrap();
        assert!(playback.has_client());
        playback.launch_receiver_app().await.unwrap();
        assert!(playback.has_player());
        playback.load_stream("bridge-stream-Den", "audio/mp3").await.unwrap();

        assert_eq!(cast.connects(), vec!["10.0.0.5:8009".to_string()]);
        assert_eq!(cast.launches(), vec!["CC1AD845".to_string()]);
        let loads = cast.loads();
        assert_eq!(loads[0].content_id, "bridge-stream-Den");
        assert_eq!(loads[0].metadata.title.as_deref(), Some("AirPlay Stream to Den"));
    }

    #[tokio::test]
    async fn test_failures_map_to_session_errors() {
        let cast = FakeCast::new();
        cast.fail_connect(true);
        let mut playback = session(&cast);
        assert!(matches!(
            playback.connect("10.0.0.5", 8009).await,
            Err(SessionError::ConnectFailed(_))
        ));

        let cast = FakeCast::new();
        cast.fail_launch(true);
        let mut playback = session(&cast);
        playback.connect("10.0.0.5", 8009).await.unwrap();
        assert!(matches!(
            playback.launch_receiver_app().await,
            Err(SessionError::LaunchFailed(_))
        ));
        assert!(matches!(
            playback.load_stream("s", "audio/mp3").await,
            Err(SessionError::LoadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_falls_back_to_default_title() {
        let cast = FakeCast::new();
        let mut playback = session(&cast);
        assert!(matches!(
            playback.update_metadata(&TrackMetadata::default()).await,
            Err(SessionError::MetadataPushFailed(_))
        ));

        playback.connect("10.0.0.5", 8009).await.unwrap();
        playback.launch_receiver_app().await.unwrap();
        playback.load_stream("bridge-stream-Den", "audio/mp3").await.unwrap();
        playback
            .update_metadata(&TrackMetadata {
                title: Some(String::new()),
                artist: Some("Artist".into()),
                album: None,
            })
            .await
            .unwrap();

        let update = cast.updates().pop().unwrap();
        assert_eq!(update.content_id, "bridge-stream-Den");
        assert_eq!(update.metadata.title.as_deref(), Some("AirPlay Stream to Den"));
        assert_eq!(update.metadata.artist.as_deref(), Some("Artist"));
    }

    #[tokio::test]
    async fn test_unchanged_metadata_is_not_resent() {
        let cast = FakeCast::new();
        let mut playback = session(&cast);
        playback.connect("10.0.0.5", 8009).await.unwrap();
        playback.launch_receiver_app().await.unwrap();
        playback.load_stream("bridge-stream-Den", "audio/mp3").await.unwrap();

        let track = TrackMetadata {
            title: Some("Song".into()),
            artist: Some("Artist".into()),
            album: None,
        };
        playback.update_metadata(&track).await.unwrap();
        playback.update_metadata(&track).await.unwrap();
        assert_eq!(cast.updates().len(), 1);

        // The default title already shows, so an empty track changes nothing
        let cast = FakeCast::new();
        let mut playback = session(&cast);
        playback.connect("10.0.0.5", 8009).await.unwrap();
        playback.launch_receiver_app().await.unwrap();
        playback.load_stream("bridge-stream-Den", "audio/mp3").await.unwrap();
        playback.update_metadata(&TrackMetadata::default()).await.unwrap();
        assert!(cast.updates().is_empty());
    }

    #[tokio::test]
    async fn test_close_once() {
        let cast = FakeCast::new();
        let mut playback = session(&cast);
        playback.connect("10.0.0.5", 8009).await.unwrap();

        assert!(playback.close().await);
        assert!(!playback.close().await);
        assert_eq!(cast.close_count(), 1);
    }
}
