//! Shared data types and the typed events the bridge emits to its caller

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorSource, SessionError};

/// A discovered playback target, keyed by its normalized name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub name: String,
    /// Announced host name
    pub host: String,
    /// Address used to connect: resolved IPv4 when known, else the host name
    pub address: String,
    pub port: u16,
    pub model: String,
    pub is_group: bool,
}

/// Lifecycle phase of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Allocating,
    ReceiverStarting,
    ReceiverReady,
    CastConnecting,
    CastReady,
    Streaming,
    Failed,
    Stopped,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Failed | SessionPhase::Stopped)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Any non-terminal phase may fail or stop. `Streaming -> CastReady`
    /// happens when the relay is re-armed after its source closed.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Allocating)
                | (Allocating, ReceiverStarting)
                | (ReceiverStarting, ReceiverReady)
                | (ReceiverReady, CastConnecting)
                | (CastConnecting, CastReady)
                | (CastReady, Streaming)
                | (Streaming, CastReady)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Allocating => "allocating",
            SessionPhase::ReceiverStarting => "receiver_starting",
            SessionPhase::ReceiverReady => "receiver_ready",
            SessionPhase::CastConnecting => "cast_connecting",
            SessionPhase::CastReady => "cast_ready",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Failed => "failed",
            SessionPhase::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Now-playing metadata extracted from the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl TrackMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }
}

/// Playback state reported by a target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatus {
    pub player_state: String,
    pub idle_reason: Option<String>,
    pub current_time: f64,
    pub media_session_id: Option<i64>,
}

/// Snapshot of one session, answered by the orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: Uuid,
    pub device_name: String,
    pub phase: SessionPhase,
    pub port: Option<u16>,
    pub is_running: bool,
    pub has_client: bool,
    pub has_player: bool,
    pub is_streaming: bool,
    pub started_at: DateTime<Utc>,
}

/// Error event payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub source: ErrorSource,
    pub device_name: Option<String>,
    pub error: String,
}

impl ErrorReport {
    pub fn session(device_name: &str, error: &SessionError) -> Self {
        Self {
            source: error.source_tag(),
            device_name: Some(device_name.to_string()),
            error: error.to_string(),
        }
    }
}

/// Events emitted by the bridge to its caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    Started,
    Stopped,
    DeviceFound(TargetDescriptor),
    DeviceLost { device_name: String },
    DeviceDisconnected { device_name: String },
    AirplayReady { device_name: String, port: u16 },
    CastConnected { device_name: String },
    PlayerStatus { device_name: String, status: PlayerStatus },
    StreamingStarted { device_name: String },
    StreamingEnded { device_name: String },
    SessionPhase { device_name: String, phase: SessionPhase },
    Error(ErrorReport),
}
