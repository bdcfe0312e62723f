//! In-process fakes for the external collaborators
//!
//! Each fake records what it was asked to do and counts releases so tests
//! can assert that a session's resources were freed exactly once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::cast::{CastChannel, CastConnector, CastEvent, MediaInfo};
use crate::config::AppConfig;
use crate::error::{CastError, DiscoveryError, ProcessError};
use crate::network::{DiscoveryEvent, DiscoverySource, ServiceAnnouncement};
use crate::process::{ExternalProcess, ProcessExit, ProcessLauncher, ProcessOutput, ProcessSpec};
use crate::protocol::PlayerStatus;
use crate::relay::StreamHub;

const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

struct ProcessShared {
    spec: Mutex<Option<ProcessSpec>>,
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
    stderr: tokio::sync::Mutex<Option<DuplexStream>>,
    exit: watch::Sender<Option<ProcessExit>>,
    terminations: AtomicUsize,
    releases: AtomicUsize,
}

/// Test-side handle to one fake process
#[derive(Clone)]
pub struct FakeProcessControl {
    shared: Arc<ProcessShared>,
}

impl FakeProcessControl {
    fn pair() -> (Self, FakeProcess) {
        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let shared = Arc::new(ProcessShared {
            spec: Mutex::new(None),
            stdout: tokio::sync::Mutex::new(Some(stdout_writer)),
            stderr: tokio::sync::Mutex::new(Some(stderr_writer)),
            exit: watch::channel(None).0,
            terminations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let process = FakeProcess {
            shared: shared.clone(),
            stdout: Some(Box::new(stdout_reader)),
            stderr: Some(Box::new(stderr_reader)),
        };
        (Self { shared }, process)
    }

    pub fn spec(&self) -> Option<ProcessSpec> {
        self.shared.spec.lock().clone()
    }

    /// File name of the launched program
    pub fn program(&self) -> String {
        self.spec()
            .and_then(|spec| spec.program.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default()
    }

    pub async fn write_stdout(&self, text: &str) {
        write_to(&self.shared.stdout, text.as_bytes()).await;
    }

    pub async fn write_stderr(&self, text: &str) {
        write_to(&self.shared.stderr, text.as_bytes()).await;
    }

    /// Exit on its own with `code`
    pub fn exit(&self, code: i32) {
        self.finish(ProcessExit { code: Some(code) });
    }

    pub fn has_exited(&self) -> bool {
        self.shared.exit.borrow().is_some()
    }

    pub fn terminate_count(&self) -> usize {
        self.shared.terminations.load(Ordering::SeqCst)
    }

    /// How many times the owner dropped the process handle
    pub fn release_count(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }

    fn finish(&self, exit: ProcessExit) {
        // Closing the pipes is what a real exit looks like to readers
        if let Ok(mut stdout) = self.shared.stdout.try_lock() {
            stdout.take();
        }
        if let Ok(mut stderr) = self.shared.stderr.try_lock() {
            stderr.take();
        }
        self.shared.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }
}

async fn write_to(pipe: &tokio::sync::Mutex<Option<DuplexStream>>, bytes: &[u8]) {
    let mut guard = pipe.lock().await;
    if let Some(writer) = guard.as_mut() {
        let _ = writer.write_all(bytes).await;
    }
}

pub struct FakeProcess {
    shared: Arc<ProcessShared>,
    stdout: Option<ProcessOutput>,
    stderr: Option<ProcessOutput>,
}

#[async_trait]
impl ExternalProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ProcessOutput> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let mut rx = self.shared.exit.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| std::io::Error::other("exit channel closed"))?;
        Ok((*exit).unwrap_or(ProcessExit { code: None }))
    }

    async fn terminate(&mut self, _grace: Duration) -> std::io::Result<ProcessExit> {
        if let Some(exit) = *self.shared.exit.borrow() {
            return Ok(exit);
        }
        self.shared.terminations.fetch_add(1, Ordering::SeqCst);
        let control = FakeProcessControl {
            shared: self.shared.clone(),
        };
        control.finish(ProcessExit { code: None });
        Ok(ProcessExit { code: None })
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
    }
}

type LaunchHook = Arc<dyn Fn(&FakeProcessControl) + Send + Sync>;

#[derive(Default)]
struct LauncherState {
    expected: VecDeque<(FakeProcessControl, FakeProcess)>,
    launched: Vec<FakeProcessControl>,
    runs: Vec<ProcessSpec>,
    failing: Vec<String>,
    hook: Option<LaunchHook>,
}

/// Launcher that hands out [`FakeProcess`]es
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create the process handed out by the next launch
    pub fn expect_process(&self) -> FakeProcessControl {
        let (control, process) = FakeProcessControl::pair();
        self.state.lock().expected.push_back((control.clone(), process));
        control
    }

    /// Called for every launched process that was not pre-created
    pub fn on_launch(&self, hook: impl Fn(&FakeProcessControl) + Send + Sync + 'static) {
        self.state.lock().hook = Some(Arc::new(hook));
    }

    /// Make launches of `program` fail to spawn
    pub fn fail_program(&self, program: &str) {
        self.state.lock().failing.push(program.to_string());
    }

    pub fn launched(&self) -> Vec<ProcessSpec> {
        self.state.lock().launched.iter().filter_map(|c| c.spec()).collect()
    }

    pub fn processes(&self, program: &str) -> Vec<FakeProcessControl> {
        self.state
            .lock()
            .launched
            .iter()
            .filter(|c| c.program() == program)
            .cloned()
            .collect()
    }

    pub fn runs(&self) -> Vec<ProcessSpec> {
        self.state.lock().runs.clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: ProcessSpec) -> Result<Box<dyn ExternalProcess>, ProcessError> {
        let (control, process, hook) = {
            let mut state = self.state.lock();
            let program = spec
                .program
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if state.failing.contains(&program) {
                return Err(ProcessError::SpawnFailed {
                    program,
                    reason: "No such file or directory".into(),
                });
            }

            let (control, process, hook) = match state.expected.pop_front() {
                Some((control, process)) => (control, process, None),
                None => {
                    let (control, process) = FakeProcessControl::pair();
                    (control, process, state.hook.clone())
                }
            };
            *control.shared.spec.lock() = Some(spec);
            state.launched.push(control.clone());
            (control, process, hook)
        };

        if let Some(hook) = hook {
            hook(&control);
        }
        Ok(Box::new(process))
    }

    async fn run(&self, spec: ProcessSpec) -> Result<ProcessExit, ProcessError> {
        self.state.lock().runs.push(spec);
        Ok(ProcessExit { code: Some(0) })
    }
}

// ---------------------------------------------------------------------------
// Cast
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CastState {
    connects: Vec<String>,
    launches: Vec<String>,
    loads: Vec<MediaInfo>,
    updates: Vec<MediaInfo>,
    closes: HashMap<String, usize>,
    fail_connect: bool,
    fail_launch: bool,
    fail_load: bool,
    fail_update: bool,
    hang_connect: bool,
    hub: Option<StreamHub>,
    channels: Vec<(String, mpsc::Sender<CastEvent>)>,
}

/// Connector whose channels talk to nothing
#[derive(Clone, Default)]
pub struct FakeCast {
    state: Arc<Mutex<CastState>>,
}

impl FakeCast {
    pub fn new() -> Self {
        Self::default()
    }

    /// On load, subscribe to the stream like a device fetching its URL
    pub fn with_hub(self, hub: StreamHub) -> Self {
        self.state.lock().hub = Some(hub);
        self
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Connection attempts never complete, like an unreachable target
    pub fn hang_connect(&self, hang: bool) {
        self.state.lock().hang_connect = hang;
    }

    pub fn fail_launch(&self, fail: bool) {
        self.state.lock().fail_launch = fail;
    }

    pub fn fail_load(&self, fail: bool) {
        self.state.lock().fail_load = fail;
    }

    pub fn fail_update(&self, fail: bool) {
        self.state.lock().fail_update = fail;
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn launches(&self) -> Vec<String> {
        self.state.lock().launches.clone()
    }

    pub fn loads(&self) -> Vec<MediaInfo> {
        self.state.lock().loads.clone()
    }

    pub fn updates(&self) -> Vec<MediaInfo> {
        self.state.lock().updates.clone()
    }

    /// Total channel closes
    pub fn close_count(&self) -> usize {
        self.state.lock().closes.values().sum()
    }

    /// Closes of channels opened to `address`
    pub fn closes_for(&self, address: &str) -> usize {
        self.state.lock().closes.get(address).copied().unwrap_or(0)
    }

    /// Drop every open connection to `address`
    pub fn lose_connection(&self, address: &str) {
        for (_, tx) in self.state.lock().channels.iter().filter(|(a, _)| a == address) {
            let _ = tx.try_send(CastEvent::ConnectionLost("socket closed".into()));
        }
    }
}

#[async_trait]
impl CastConnector for FakeCast {
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn CastChannel>, CastError> {
        let hang = {
            let mut state = self.state.lock();
            state.connects.push(format!("{}:{}", address, port));
            state.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(CastError::Connect("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        state.channels.push((address.to_string(), tx.clone()));
        Ok(Box::new(FakeChannel {
            address: address.to_string(),
            state: self.state.clone(),
            events_tx: tx,
            events: Some(rx),
            closed: false,
        }))
    }
}

struct FakeChannel {
    address: String,
    state: Arc<Mutex<CastState>>,
    events_tx: mpsc::Sender<CastEvent>,
    events: Option<mpsc::Receiver<CastEvent>>,
    closed: bool,
}

#[async_trait]
impl CastChannel for FakeChannel {
    async fn launch(&mut self, app_id: &str) -> Result<(), CastError> {
        let mut state = self.state.lock();
        state.launches.push(app_id.to_string());
        if state.fail_launch {
            return Err(CastError::Rejected("LAUNCH_ERROR: NOT_FOUND".into()));
        }
        Ok(())
    }

    async fn load(&mut self, media: &MediaInfo) -> Result<(), CastError> {
        let hub = {
            let mut state = self.state.lock();
            state.loads.push(media.clone());
            if state.fail_load {
                return Err(CastError::Rejected("LOAD_FAILED".into()));
            }
            state.hub.clone()
        };

        if let Some(mut listener) = hub.and_then(|hub| hub.subscribe(&media.content_id)) {
            tokio::spawn(async move {
                while let Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) =
                    listener.recv().await
                {}
            });
        }
        let _ = self.events_tx.try_send(CastEvent::Status(PlayerStatus {
            player_state: "BUFFERING".into(),
            idle_reason: None,
            current_time: 0.0,
            media_session_id: Some(1),
        }));
        Ok(())
    }

    async fn update_media(&mut self, media: &MediaInfo) -> Result<(), CastError> {
        let mut state = self.state.lock();
        state.updates.push(media.clone());
        if state.fail_update {
            return Err(CastError::Timeout("update".into()));
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CastEvent>> {
        self.events.take()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            *self.state.lock().closes.entry(self.address.clone()).or_default() += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Discovery source fed by the test through [`FakeDiscoveryFeed`]
pub struct FakeDiscovery {
    rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    stops: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct FakeDiscoveryFeed {
    tx: mpsc::Sender<DiscoveryEvent>,
    stops: Arc<AtomicUsize>,
}

impl FakeDiscovery {
    pub fn new() -> (Self, FakeDiscoveryFeed) {
        let (tx, rx) = mpsc::channel(64);
        let stops = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx: Some(rx),
                stops: stops.clone(),
            },
            FakeDiscoveryFeed { tx, stops },
        )
    }
}

#[async_trait]
impl DiscoverySource for FakeDiscovery {
    async fn subscribe(
        &mut self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        self.rx.take().ok_or_else(|| DiscoveryError::Browse {
            service_type: service_type.to_string(),
            reason: "already subscribed".into(),
        })
    }

    async fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeDiscoveryFeed {
    pub fn announcement(name: &str, host: &str, port: u16) -> ServiceAnnouncement {
        ServiceAnnouncement {
            name: Some(name.to_string()),
            host: host.to_string(),
            addresses: host.parse::<Ipv4Addr>().into_iter().collect(),
            port,
            service_type: crate::constants::CAST_SERVICE_TYPE.to_string(),
            txt: HashMap::new(),
        }
    }

    pub async fn up(&self, name: &str, host: &str, port: u16) {
        self.send(DiscoveryEvent::Up(Self::announcement(name, host, port)))
            .await;
    }

    pub async fn down(&self, name: &str) {
        let announcement = ServiceAnnouncement {
            name: Some(name.to_string()),
            ..ServiceAnnouncement::default()
        };
        self.send(DiscoveryEvent::Down(announcement)).await;
    }

    pub async fn send(&self, event: DiscoveryEvent) {
        let _ = self.tx.send(event).await;
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Bridge fixtures
// ---------------------------------------------------------------------------

/// Marker the scripted receiver prints once it is listening
pub const READY_LINE: &str = "listening";

/// Config with every file under `dir` and fast timeouts
pub fn bridge_config(dir: &Path, port_start: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.ports.start = port_start;
    config.ports.probe_timeout_ms = 200;
    config.receiver.config_dir = dir.join("conf");
    config.receiver.pipe_dir = dir.to_path_buf();
    config.receiver.ready_line = Some(READY_LINE.to_string());
    config.receiver.probe_port = false;
    config.receiver.ready_timeout_ms = 1_000;
    config.receiver.kill_stale_on_start = false;
    config.receiver.stop_grace_ms = 100;
    config.relay.chunk_size = 4;
    config.relay.restart_delay_ms = 50;
    config.cast.request_timeout_ms = 500;
    config
}

/// Launcher whose receivers report ready and whose transcoders emit audio
pub fn scripted_launcher() -> FakeLauncher {
    let launcher = FakeLauncher::new();
    launcher.on_launch(|control| {
        let control = control.clone();
        tokio::spawn(async move {
            match control.program().as_str() {
                "shairport-sync" => {
                    control
                        .write_stdout(&format!("{} on port\n", READY_LINE))
                        .await
                }
                "ffmpeg" => control.write_stdout("ID3\u{1}").await,
                _ => {}
            }
        });
    });
    launcher
}
