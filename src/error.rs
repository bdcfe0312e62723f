//! Error types for the bridge

use serde::Serialize;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Cast error: {0}")]
    Cast(#[from] CastError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge is already running")]
    AlreadyRunning,
}

/// Per-session failures.
///
/// Everything except [`SessionError::MetadataPushFailed`] forces the owning
/// session into `failed` and triggers a full teardown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No available port in [{start}, {start}+{attempts})")]
    NoPortAvailable { start: u16, attempts: u16 },

    #[error("Receiver failed to start: {0}")]
    ReceiverStartFailed(String),

    #[error("Receiver exited unexpectedly (code {code:?})")]
    ReceiverCrashed { code: Option<i32> },

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Relay failed: {0}")]
    RelayFailed(String),

    #[error("Metadata push failed: {0}")]
    MetadataPushFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::MetadataPushFailed(_))
    }

    /// Subsystem the error originated from.
    pub fn source_tag(&self) -> ErrorSource {
        match self {
            SessionError::NoPortAvailable { .. } => ErrorSource::Allocator,
            SessionError::ReceiverStartFailed(_) | SessionError::ReceiverCrashed { .. } => {
                ErrorSource::Receiver
            }
            SessionError::ConnectFailed(_) | SessionError::ConnectionLost(_) => ErrorSource::Cast,
            SessionError::LaunchFailed(_) => ErrorSource::MediaReceiver,
            SessionError::LoadFailed(_) => ErrorSource::Streaming,
            SessionError::RelayFailed(_) => ErrorSource::Transcoder,
            SessionError::MetadataPushFailed(_) => ErrorSource::Metadata,
        }
    }
}

/// Origin tag attached to every error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    Discovery,
    Allocator,
    Receiver,
    Cast,
    MediaReceiver,
    Streaming,
    Transcoder,
    Metadata,
    Bridge,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorSource::Discovery => "discovery",
            ErrorSource::Allocator => "allocator",
            ErrorSource::Receiver => "receiver",
            ErrorSource::Cast => "cast",
            ErrorSource::MediaReceiver => "media-receiver",
            ErrorSource::Streaming => "streaming",
            ErrorSource::Transcoder => "transcoder",
            ErrorSource::Metadata => "metadata",
            ErrorSource::Bridge => "bridge",
        };
        f.write_str(name)
    }
}

/// External process errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Named pipe error at {path}: {reason}")]
    Pipe { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cast protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CastError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("No application session; launch first")]
    NotLaunched,

    #[error("No media loaded")]
    NotLoaded,

    #[error("Connection closed")]
    Closed,
}

/// Discovery subscription errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to start discovery daemon: {0}")]
    Daemon(String),

    #[error("Failed to browse {service_type}: {reason}")]
    Browse { service_type: String, reason: String },
}

/// Device registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session already exists for {0}")]
    SessionExists(String),

    #[error("Device not found: {0}")]
    NotFound(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
