//! Top-level bridge control
//!
//! [`BridgeOrchestrator`] owns discovery and the session registry. A single
//! actor task applies discovery events and session exits in arrival order,
//! so the registry never sees two writers for the same device name.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::cast::{CastConnector, StreamUrls, TlsCastConnector};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::network::{
    DiscoveryEvent, DiscoverySource, DiscoveryWatcher, MdnsDiscovery, PortAllocator,
    WatcherNotification,
};
use crate::process::{ProcessLauncher, TokioLauncher};
use crate::protocol::{BridgeEvent, SessionStatus, TargetDescriptor};
use crate::receiver::kill_stale_receivers;
use crate::registry::DeviceRegistry;
use crate::relay::StreamHub;
use crate::session::{SessionDeps, SessionExit, SessionHandle};


const EVENT_CAPACITY: usize = 256;

/// The external collaborators a bridge runs against
pub struct Collaborators {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub connector: Arc<dyn CastConnector>,
    pub discovery: Box<dyn DiscoverySource>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    actor: JoinHandle<Box<dyn DiscoverySource>>,
}

enum Lifecycle {
    Idle(Box<dyn DiscoverySource>),
    Running(Running),
    /// Discovery source lost to a panicked actor
    Broken,
}

pub struct BridgeOrchestrator {
    config: Arc<AppConfig>,
    launcher: Arc<dyn ProcessLauncher>,
    connector: Arc<dyn CastConnector>,
    registry: Arc<DeviceRegistry>,
    ports: PortAllocator,
    hub: StreamHub,
    events: broadcast::Sender<BridgeEvent>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl BridgeOrchestrator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let ports = PortAllocator::new(
            config.ports.start,
            config.ports.max_tries,
            config.ports.probe_timeout(),
        );
        let hub = StreamHub::new(config.http.stream_buffer_chunks);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config: Arc::new(config),
            launcher: collaborators.launcher,
            connector: collaborators.connector,
            registry: Arc::new(DeviceRegistry::new()),
            ports,
            hub,
            events,
            lifecycle: Mutex::new(Lifecycle::Idle(collaborators.discovery)),
            running: AtomicBool::new(false),
        }
    }

    /// Real subprocesses, TLS cast connections and mDNS discovery
    pub fn with_defaults(config: AppConfig) -> Self {
        let connector = TlsCastConnector::new(config.cast.clone(), StreamUrls::from_config(&config.http));
        Self::new(
            config,
            Collaborators {
                launcher: Arc::new(TokioLauncher::new()),
                connector: Arc::new(connector),
                discovery: Box::new(MdnsDiscovery::new()),
            },
        )
    }

    /// Receive bridge events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start discovery; sessions follow as targets appear
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut discovery = match std::mem::replace(&mut *lifecycle, Lifecycle::Broken) {
            Lifecycle::Idle(discovery) => discovery,
            other => {
                *lifecycle = other;
                return Err(Error::AlreadyRunning);
            }
        };

        if self.config.receiver.kill_stale_on_start {
            kill_stale_receivers(self.launcher.as_ref(), &self.config.receiver).await;
        }

        let watcher = DiscoveryWatcher::new(self.config.discovery.service_type.clone());
        let announcements = match watcher.subscribe(discovery.as_mut()).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Failed to start discovery: {}", e);
                *lifecycle = Lifecycle::Idle(discovery);
                return Err(e.into());
            }
        };

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            config: self.config.clone(),
            launcher: self.launcher.clone(),
            connector: self.connector.clone(),
            ports: self.ports.clone(),
            hub: self.hub.clone(),
            events: self.events.clone(),
            exits: exits_tx,
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let actor = Actor {
            watcher,
            registry: self.registry.clone(),
            deps,
            stopping: JoinSet::new(),
            draining: HashMap::new(),
        };
        let actor = tokio::spawn(actor.run(announcements, exits_rx, shutdown_rx, discovery));

        *lifecycle = Lifecycle::Running(Running { shutdown, actor });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Bridge started");
        let _ = self.events.send(BridgeEvent::Started);
        Ok(())
    }

    /// Stop discovery and every session. Safe to call at any time.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Broken) {
            Lifecycle::Running(running) => running,
            other => {
                *lifecycle = other;
                return;
            }
        };

        let _ = running.shutdown.send(());
        *lifecycle = match running.actor.await {
            Ok(discovery) => Lifecycle::Idle(discovery),
            Err(e) => {
                tracing::error!("Bridge actor panicked: {}", e);
                Lifecycle::Broken
            }
        };

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Bridge stopped");
        let _ = self.events.send(BridgeEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Targets currently known, sorted by name
    pub fn device_list(&self) -> Vec<TargetDescriptor> {
        self.registry.devices()
    }

    pub fn session_status(&self, device_name: &str) -> Option<SessionStatus> {
        self.registry.with_session(device_name, SessionHandle::status)
    }

    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut sessions = self.registry.map_sessions(|_, session| session.status());
        sessions.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        sessions
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn leased_ports(&self) -> usize {
        self.ports.leased_count()
    }
}

struct Actor {
    watcher: DiscoveryWatcher,
    registry: Arc<DeviceRegistry>,
    deps: SessionDeps,
    /// Sessions torn down because their target went away; each yields its device name
    stopping: JoinSet<String>,
    /// Names whose old session is still tearing down, with the descriptor
    /// to start once it is gone
    draining: HashMap<String, Option<TargetDescriptor>>,
}

impl Actor {
    async fn run(
        mut self,
        mut announcements: mpsc::Receiver<DiscoveryEvent>,
        mut exits: mpsc::UnboundedReceiver<SessionExit>,
        mut shutdown: oneshot::Receiver<()>,
        mut discovery: Box<dyn DiscoverySource>,
    ) -> Box<dyn DiscoverySource> {
        let mut discovering = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = announcements.recv(), if discovering => match event {
                    Some(event) => {
                        if let Some(notification) = self.watcher.handle_event(&self.registry, event) {
                            self.apply(notification);
                        }
                    }
                    None => {
                        tracing::warn!("Discovery feed closed");
                        discovering = false;
                    }
                },
                Some(exit) = exits.recv() => self.session_exited(exit),
                Some(joined) = self.stopping.join_next(), if !self.stopping.is_empty() => match joined {
                    Ok(name) => self.teardown_finished(name),
                    Err(e) => tracing::error!("Session teardown panicked: {}", e),
                },
            }
        }

        self.shutdown().await;
        discovery.stop().await;
        discovery
    }

    fn apply(&mut self, notification: WatcherNotification) {
        match notification {
            WatcherNotification::TargetFound(descriptor) => {
                self.emit(BridgeEvent::DeviceFound(descriptor.clone()));
                if let Some(waiting) = self.draining.get_mut(&descriptor.name) {
                    // Receiver names and pipe paths are still held by the old session
                    tracing::debug!("Deferring session for {} until teardown ends", descriptor.name);
                    *waiting = Some(descriptor);
                    return;
                }
                self.start_session(descriptor);
            }
            WatcherNotification::TargetLost(name) => {
                self.emit(BridgeEvent::DeviceLost {
                    device_name: name.clone(),
                });
                if let Some(waiting) = self.draining.get_mut(&name) {
                    *waiting = None;
                }
                if let Some(session) = self.registry.remove_session(&name) {
                    tracing::info!("Stopping session for {}", name);
                    self.draining.insert(name.clone(), None);
                    let device_name = name.clone();
                    self.stopping.spawn(async move {
                        session.stop().await;
                        device_name
                    });
                }
                self.emit(BridgeEvent::DeviceDisconnected { device_name: name });
            }
        }
    }

    fn start_session(&self, descriptor: TargetDescriptor) {
        if self.registry.has_session(&descriptor.name) {
            return;
        }
        let name = descriptor.name.clone();
        let session = SessionHandle::spawn(descriptor, self.deps.clone());
        if let Err(e) = self.registry.try_insert_session(&name, session) {
            tracing::error!("Could not register session for {}: {}", name, e);
        }
    }

    /// Start the session a re-announcement asked for while `name` was tearing down
    fn teardown_finished(&mut self, name: String) {
        let Some(Some(descriptor)) = self.draining.remove(&name) else {
            return;
        };
        if self.registry.contains_device(&name) {
            self.start_session(descriptor);
        }
    }

    /// Forget a session that ended on its own
    fn session_exited(&mut self, exit: SessionExit) {
        let removed = self
            .registry
            .remove_session_if(&exit.device_name, |session| session.id() == exit.id);
        if removed.is_some() {
            tracing::info!("Session for {} ended in {}", exit.device_name, exit.phase);
        }
    }

    async fn shutdown(&mut self) {
        let sessions = self.registry.drain_sessions();
        tracing::info!("Stopping {} session(s)", sessions.len());
        join_all(sessions.into_iter().map(|(_, session)| session.stop())).await;

        while let Some(joined) = self.stopping.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Session teardown panicked: {}", e);
            }
        }
        self.draining.clear();

        for device in self.registry.devices() {
            self.registry.remove_device(&device.name);
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.deps.events.send(event);
    }
}
