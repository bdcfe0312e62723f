//! The session task

use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::cast::{CastConnector, CastEvent, PlaybackSession};
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::network::{PortAllocator, PortLease};
use crate::pipe::{sanitize_file_component, NamedPipe};
use crate::process::ProcessLauncher;
use crate::protocol::{BridgeEvent, ErrorReport, SessionPhase, TargetDescriptor, TrackMetadata};
use crate::receiver::{OutputMode, ReceiverConfig, ReceiverEvent, ReceiverSupervisor};
use crate::relay::{stream_id_for, LivePublisher, RelayEvent, StreamHub, StreamRelay, TranscodeConfig};
use crate::session::SessionFlags;

const RECEIVER_EVENT_QUEUE: usize = 64;
const RELAY_EVENT_QUEUE: usize = 8;

/// Everything sessions share
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<AppConfig>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub connector: Arc<dyn CastConnector>,
    pub ports: PortAllocator,
    pub hub: StreamHub,
    pub events: broadcast::Sender<BridgeEvent>,
    /// Told once when a session reaches a terminal phase
    pub exits: mpsc::UnboundedSender<SessionExit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub device_name: String,
    pub id: Uuid,
    pub phase: SessionPhase,
}

/// Resources owned by one session; each is released at most once
#[derive(Default)]
struct Resources {
    lease: Option<PortLease>,
    audio_pipe: Option<NamedPipe>,
    metadata_pipe: Option<NamedPipe>,
    receiver: Option<ReceiverSupervisor>,
    playback: Option<PlaybackSession>,
    publisher: Option<LivePublisher>,
    relay: Option<StreamRelay>,
}

pub(super) struct SessionRunner {
    id: Uuid,
    descriptor: TargetDescriptor,
    deps: SessionDeps,
    phase: watch::Sender<SessionPhase>,
    flags: Arc<Mutex<SessionFlags>>,
}

impl SessionRunner {
    pub(super) fn new(
        id: Uuid,
        descriptor: TargetDescriptor,
        deps: SessionDeps,
        phase: watch::Sender<SessionPhase>,
        flags: Arc<Mutex<SessionFlags>>,
    ) -> Self {
        Self {
            id,
            descriptor,
            deps,
            phase,
            flags,
        }
    }

    pub(super) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut resources = Resources::default();

        // Dropping `drive` on shutdown cancels whatever it was waiting on
        let outcome = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
            result = self.drive(&mut resources) => result,
        };

        let terminal = match &outcome {
            Ok(()) => SessionPhase::Stopped,
            Err(e) => {
                tracing::error!("Session for {} failed: {}", self.descriptor.name, e);
                self.emit(BridgeEvent::Error(ErrorReport::session(&self.descriptor.name, e)));
                SessionPhase::Failed
            }
        };

        self.teardown(&mut resources).await;
        self.set_phase(terminal);
        tracing::info!("Session for {} ended: {}", self.descriptor.name, terminal);

        let _ = self.deps.exits.send(SessionExit {
            device_name: self.descriptor.name.clone(),
            id: self.id,
            phase: terminal,
        });
    }

    async fn drive(&self, res: &mut Resources) -> Result<(), SessionError> {
        let name = self.descriptor.name.as_str();
        let config = &self.deps.config;

        self.set_phase(SessionPhase::Allocating);
        let port = res.lease.insert(self.deps.ports.allocate().await?).port();
        self.flags.lock().port = Some(port);

        let file_name = sanitize_file_component(name);
        let pipe_dir = &config.receiver.pipe_dir;
        let audio_path = pipe_dir.join(format!("airplay-audio-{}", file_name));
        let metadata_path = pipe_dir.join(format!("shairport-sync-metadata-{}", file_name));
        res.audio_pipe = Some(create_pipe(&audio_path)?);
        res.metadata_pipe = Some(create_pipe(&metadata_path)?);

        self.set_phase(SessionPhase::ReceiverStarting);
        let (receiver_tx, mut receiver_events) = mpsc::channel(RECEIVER_EVENT_QUEUE);
        let receiver_config = ReceiverConfig {
            name: config.receiver.receiver_name(name),
            port,
            output_mode: OutputMode::Pipe,
            config_path: config
                .receiver
                .config_dir
                .join(format!("shairport-sync-{}.conf", file_name)),
            audio_pipe: audio_path.clone(),
            metadata_pipe: metadata_path,
        };
        res.receiver
            .insert(ReceiverSupervisor::new(
                receiver_config,
                config.receiver.clone(),
                self.deps.launcher.clone(),
                receiver_tx,
            ))
            .start()
            .await?;
        self.flags.lock().is_running = true;
        self.set_phase(SessionPhase::ReceiverReady);
        self.emit(BridgeEvent::AirplayReady {
            device_name: name.to_string(),
            port,
        });

        self.set_phase(SessionPhase::CastConnecting);
        let mut cast_events = None;
        let mut pending_track = None;
        let playback = res.playback.insert(PlaybackSession::new(
            name,
            self.deps.connector.clone(),
            config.cast.clone(),
        ));
        self.guarded(
            &mut receiver_events,
            &mut cast_events,
            &mut pending_track,
            playback.connect(&self.descriptor.address, self.descriptor.port),
        )
        .await?;
        self.flags.lock().has_client = true;
        cast_events = playback.take_events();

        self.guarded(
            &mut receiver_events,
            &mut cast_events,
            &mut pending_track,
            playback.launch_receiver_app(),
        )
        .await?;
        self.flags.lock().has_player = true;
        self.emit(BridgeEvent::CastConnected {
            device_name: name.to_string(),
        });

        let stream_id = stream_id_for(name);
        let publisher = res.publisher.insert(self.deps.hub.register(&stream_id)).clone();
        self.guarded(
            &mut receiver_events,
            &mut cast_events,
            &mut pending_track,
            playback.load_stream(&stream_id, &config.cast.content_type),
        )
        .await?;
        self.set_phase(SessionPhase::CastReady);

        if let Some(track) = pending_track.take() {
            self.push_metadata(playback, &track).await?;
        }

        let (relay_tx, mut relay_events) = mpsc::channel(RELAY_EVENT_QUEUE);
        let transcode = TranscodeConfig::from_relay(&config.relay);
        res.relay = Some(self.start_relay(&transcode, &audio_path, &publisher, &relay_tx).await?);
        let mut rearm_at: Option<Instant> = None;

        loop {
            tokio::select! {
                event = receiver_events.recv() => match event {
                    Some(ReceiverEvent::Metadata(track)) => {
                        if let Some(playback) = res.playback.as_mut() {
                            self.push_metadata(playback, &track).await?;
                        }
                    }
                    Some(ReceiverEvent::MetadataError(reason)) => {
                        tracing::debug!("{}: unreadable metadata: {}", name, reason);
                    }
                    Some(ReceiverEvent::Log { .. }) => {}
                    Some(ReceiverEvent::Crashed { code }) => {
                        self.flags.lock().is_running = false;
                        return Err(SessionError::ReceiverCrashed { code });
                    }
                    None => return Err(SessionError::ReceiverCrashed { code: None }),
                },
                event = next_cast_event(&mut cast_events) => match event {
                    Some(CastEvent::Status(status)) => {
                        tracing::debug!("{}: player {}", name, status.player_state);
                        self.emit(BridgeEvent::PlayerStatus {
                            device_name: name.to_string(),
                            status,
                        });
                    }
                    Some(CastEvent::ConnectionLost(reason)) => {
                        return Err(SessionError::ConnectionLost(reason));
                    }
                    None => return Err(SessionError::ConnectionLost("event stream closed".into())),
                },
                Some(event) = relay_events.recv() => match event {
                    RelayEvent::StreamingStarted => {
                        self.flags.lock().is_streaming = true;
                        self.set_phase(SessionPhase::Streaming);
                        self.emit(BridgeEvent::StreamingStarted {
                            device_name: name.to_string(),
                        });
                    }
                    RelayEvent::StreamingEnded => {
                        self.flags.lock().is_streaming = false;
                        self.emit(BridgeEvent::StreamingEnded {
                            device_name: name.to_string(),
                        });
                        self.set_phase(SessionPhase::CastReady);
                        if let Some(mut finished) = res.relay.take() {
                            finished.stop().await;
                        }
                        rearm_at = Some(Instant::now() + config.relay.restart_delay());
                    }
                    RelayEvent::Failed(reason) => return Err(SessionError::RelayFailed(reason)),
                },
                _ = sleep_until(rearm_at) => {
                    rearm_at = None;
                    tracing::debug!("{}: re-arming relay", name);
                    res.relay = Some(self.start_relay(&transcode, &audio_path, &publisher, &relay_tx).await?);
                }
            }
        }
    }

    /// Run one cast setup step while still watching the receiver and the
    /// cast connection, so a crash or disconnect aborts the step at once.
    /// Metadata arriving before the stream is loaded is kept for later.
    async fn guarded<T>(
        &self,
        receiver_events: &mut mpsc::Receiver<ReceiverEvent>,
        cast_events: &mut Option<mpsc::Receiver<CastEvent>>,
        pending_track: &mut Option<TrackMetadata>,
        step: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                result = &mut step => return result,
                event = receiver_events.recv() => match event {
                    Some(ReceiverEvent::Metadata(track)) => *pending_track = Some(track),
                    Some(ReceiverEvent::Crashed { code }) => {
                        self.flags.lock().is_running = false;
                        return Err(SessionError::ReceiverCrashed { code });
                    }
                    Some(_) => {}
                    None => return Err(SessionError::ReceiverCrashed { code: None }),
                },
                event = next_cast_event(cast_events) => match event {
                    Some(CastEvent::Status(status)) => self.emit(BridgeEvent::PlayerStatus {
                        device_name: self.descriptor.name.clone(),
                        status,
                    }),
                    Some(CastEvent::ConnectionLost(reason)) => {
                        return Err(SessionError::ConnectionLost(reason));
                    }
                    None => return Err(SessionError::ConnectionLost("event stream closed".into())),
                },
            }
        }
    }

    /// Push now-playing metadata; only fatal errors end the session
    async fn push_metadata(
        &self,
        playback: &mut PlaybackSession,
        track: &TrackMetadata,
    ) -> Result<(), SessionError> {
        match playback.update_metadata(track).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("{}: {}", self.descriptor.name, e);
                self.emit(BridgeEvent::Error(ErrorReport::session(&self.descriptor.name, &e)));
                Ok(())
            }
        }
    }

    async fn start_relay(
        &self,
        transcode: &TranscodeConfig,
        audio_path: &Path,
        publisher: &LivePublisher,
        events: &mpsc::Sender<RelayEvent>,
    ) -> Result<StreamRelay, SessionError> {
        StreamRelay::start(
            self.deps.launcher.as_ref(),
            transcode.process_spec(audio_path),
            publisher.clone(),
            self.deps.config.relay.chunk_size,
            self.deps.config.receiver.stop_grace(),
            events.clone(),
        )
        .await
    }

    /// Release everything the session owns, in reverse order of acquisition
    async fn teardown(&self, res: &mut Resources) {
        if let Some(mut relay) = res.relay.take() {
            relay.stop().await;
        }
        if let Some(mut playback) = res.playback.take() {
            playback.close().await;
        }
        if let Some(mut receiver) = res.receiver.take() {
            receiver.stop().await;
        }
        if let Some(publisher) = res.publisher.take() {
            self.deps.hub.unregister(&publisher);
        }
        for mut pipe in [res.audio_pipe.take(), res.metadata_pipe.take()]
            .into_iter()
            .flatten()
        {
            pipe.remove();
        }
        if let Some(mut lease) = res.lease.take() {
            lease.release();
        }

        let mut flags = self.flags.lock();
        flags.is_running = false;
        flags.has_client = false;
        flags.has_player = false;
        flags.is_streaming = false;
    }

    /// Move to `next` if the transition is legal; announces the change
    fn set_phase(&self, next: SessionPhase) -> bool {
        let current = *self.phase.borrow();
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                "{}: ignoring illegal phase change {} -> {}",
                self.descriptor.name,
                current,
                next
            );
            return false;
        }

        self.phase.send_replace(next);
        tracing::debug!("{}: {} -> {}", self.descriptor.name, current, next);
        self.emit(BridgeEvent::SessionPhase {
            device_name: self.descriptor.name.clone(),
            phase: next,
        });
        true
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine
        let _ = self.deps.events.send(event);
    }
}

fn create_pipe(path: &Path) -> Result<NamedPipe, SessionError> {
    NamedPipe::create(path).map_err(|e| SessionError::ReceiverStartFailed(e.to_string()))
}

async fn next_cast_event(events: &mut Option<mpsc::Receiver<CastEvent>>) -> Option<CastEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
