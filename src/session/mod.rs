//! Per-target relay sessions
//!
//! A session is one spawned task that walks the phase chain
//! `idle -> allocating -> receiver_starting -> receiver_ready ->
//! cast_connecting -> cast_ready -> streaming` and ends in `failed` or
//! `stopped`. [`SessionHandle`] is what the registry stores.

mod runner;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{SessionPhase, SessionStatus, TargetDescriptor};

pub use runner::{SessionDeps, SessionExit};

/// Resource flags reported by status queries
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SessionFlags {
    pub port: Option<u16>,
    pub is_running: bool,
    pub has_client: bool,
    pub has_player: bool,
    pub is_streaming: bool,
}

pub struct SessionHandle {
    id: Uuid,
    device_name: String,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    phase: watch::Receiver<SessionPhase>,
    flags: Arc<Mutex<SessionFlags>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start a session for `descriptor`
    pub fn spawn(descriptor: TargetDescriptor, deps: SessionDeps) -> Self {
        let id = Uuid::new_v4();
        let device_name = descriptor.name.clone();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (phase_tx, phase) = watch::channel(SessionPhase::Idle);
        let flags = Arc::new(Mutex::new(SessionFlags::default()));

        let runner = runner::SessionRunner::new(id, descriptor, deps, phase_tx, flags.clone());
        let task = tokio::spawn(runner.run(shutdown_rx));

        tracing::info!("Session {} started for {}", id, device_name);
        Self {
            id,
            device_name,
            started_at: Utc::now(),
            shutdown,
            phase,
            flags,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let flags = *self.flags.lock();
        SessionStatus {
            id: self.id,
            device_name: self.device_name.clone(),
            phase: self.phase(),
            port: flags.port,
            is_running: flags.is_running,
            has_client: flags.has_client,
            has_player: flags.has_player,
            is_streaming: flags.is_streaming,
            started_at: self.started_at,
        }
    }

    /// Ask the session to tear down without waiting for it
    pub fn request_stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Tear the session down and wait until its resources are released
    pub async fn stop(self) -> SessionPhase {
        self.request_stop();
        if let Err(e) = self.task.await {
            tracing::error!("Session task for {} panicked: {}", self.device_name, e);
        }
        let phase = *self.phase.borrow();
        phase
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("device_name", &self.device_name)
            .field("phase", &self.phase())
            .finish()
    }
}
