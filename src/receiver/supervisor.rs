//! Receiver subprocess supervision
//!
//! One supervisor per session. `start` returns only once the receiver is
//! ready to accept a source connection; afterwards the supervisor forwards
//! log lines and metadata and reports an unrequested exit as a crash.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ReceiverSettings;
use crate::error::SessionError;
use crate::process::{ExternalProcess, ProcessExit, ProcessLauncher, ProcessOutput, ProcessSpec};
use crate::protocol::TrackMetadata;
use crate::receiver::config::ReceiverConfig;
use crate::receiver::metadata::{MetadataParser, TrackAssembler};

const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const METADATA_REOPEN_DELAY: Duration = Duration::from_millis(250);

/// Which standard stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Notifications from a running receiver to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Log { stream: LogStream, line: String },
    Metadata(TrackMetadata),
    MetadataError(String),
    Crashed { code: Option<i32> },
}

/// Supervises one receiver process
pub struct ReceiverSupervisor {
    config: ReceiverConfig,
    settings: ReceiverSettings,
    launcher: Arc<dyn ProcessLauncher>,
    events: mpsc::Sender<ReceiverEvent>,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReceiverSupervisor {
    pub fn new(
        config: ReceiverConfig,
        settings: ReceiverSettings,
        launcher: Arc<dyn ProcessLauncher>,
        events: mpsc::Sender<ReceiverEvent>,
    ) -> Self {
        Self {
            config,
            settings,
            launcher,
            events,
            running: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            monitor: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the receiver and wait until it is ready.
    ///
    /// On timeout or early exit the process is killed and
    /// `ReceiverStartFailed` is returned.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::ReceiverStartFailed(
                "receiver is already running".to_string(),
            ));
        }

        self.config
            .write()
            .await
            .map_err(|e| SessionError::ReceiverStartFailed(format!("writing config: {}", e)))?;

        self.tasks.push(tokio::spawn(read_metadata_pipe(
            self.config.metadata_pipe.clone(),
            self.events.clone(),
        )));

        let spec = ProcessSpec::new(&self.settings.binary)
            .arg("-c")
            .arg(self.config.config_path.display().to_string())
            .args(self.settings.extra_args.iter().cloned());

        let mut process = match self.launcher.launch(spec).await {
            Ok(process) => process,
            Err(e) => {
                self.abort_tasks();
                return Err(SessionError::ReceiverStartFailed(e.to_string()));
            }
        };
        self.running.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);

        tracing::info!(
            "Launched receiver \"{}\" on port {} (pid {:?})",
            self.config.name,
            self.config.port,
            process.id()
        );

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let ready_line = self.settings.ready_line.clone().filter(|l| !l.is_empty());
        let ready_tx = Arc::new(ready_tx);
        if let Some(stdout) = process.take_stdout() {
            self.tasks.push(tokio::spawn(forward_lines(
                self.config.name.clone(),
                stdout,
                LogStream::Stdout,
                ready_line.clone(),
                ready_tx.clone(),
                self.events.clone(),
            )));
        }
        if let Some(stderr) = process.take_stderr() {
            self.tasks.push(tokio::spawn(forward_lines(
                self.config.name.clone(),
                stderr,
                LogStream::Stderr,
                ready_line,
                ready_tx,
                self.events.clone(),
            )));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None);
        self.stop_tx = Some(stop_tx);
        self.monitor = Some(tokio::spawn(monitor(
            process,
            stop_rx,
            exit_tx,
            self.settings.stop_grace(),
            self.running.clone(),
            self.ready.clone(),
            self.events.clone(),
        )));

        let port = self.config.port;
        let probe_port = self.settings.probe_port;
        let readiness = async {
            tokio::select! {
                _ = ready_rx.wait_for(|ready| *ready) => Ok(()),
                _ = probe_until_listening(port), if probe_port => Ok(()),
                exit = exit_rx.wait_for(|exit| exit.is_some()) => {
                    let code = exit.ok().and_then(|exit| exit.and_then(|e| e.code));
                    Err(format!("receiver exited before ready (code {:?})", code))
                }
            }
        };

        let outcome = match tokio::time::timeout(self.settings.ready_timeout(), readiness).await {
            Ok(Ok(())) => {
                self.ready.store(true, Ordering::SeqCst);
                // Exit raced with readiness
                if exit_rx.borrow().is_some() {
                    Err("receiver exited during startup".to_string())
                } else {
                    Ok(())
                }
            }
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!(
                "receiver not ready within {:?}",
                self.settings.ready_timeout()
            )),
        };

        match outcome {
            Ok(()) => {
                tracing::info!("Receiver \"{}\" ready on port {}", self.config.name, port);
                Ok(())
            }
            Err(reason) => {
                self.stop().await;
                Err(SessionError::ReceiverStartFailed(reason))
            }
        }
    }

    /// Terminate the receiver. Idempotent.
    pub async fn stop(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
            tracing::debug!("Receiver \"{}\" stopped", self.config.name);
        }
        self.running.store(false, Ordering::SeqCst);
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ReceiverSupervisor {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.abort_tasks();
    }
}

/// Owns the process until it exits or a stop is requested
async fn monitor(
    mut process: Box<dyn ExternalProcess>,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    grace: Duration,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    events: mpsc::Sender<ReceiverEvent>,
) {
    let (result, requested) = tokio::select! {
        result = process.wait() => (result, false),
        _ = stop_rx => (process.terminate(grace).await, true),
    };

    let exit = match result {
        Ok(exit) => exit,
        Err(e) => {
            tracing::warn!("Failed to reap receiver: {}", e);
            ProcessExit { code: None }
        }
    };
    let _ = exit_tx.send(Some(exit));

    let was_running = running.swap(false, Ordering::SeqCst);
    if !requested && was_running && ready.load(Ordering::SeqCst) {
        tracing::warn!("Receiver exited unexpectedly (code {:?})", exit.code);
        let _ = events.send(ReceiverEvent::Crashed { code: exit.code }).await;
    }
}

async fn forward_lines(
    receiver: String,
    output: ProcessOutput,
    stream: LogStream,
    ready_line: Option<String>,
    ready_tx: Arc<watch::Sender<bool>>,
    events: mpsc::Sender<ReceiverEvent>,
) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "receiver", %receiver, ?stream, "{}", line);
        if ready_line.as_deref().is_some_and(|marker| line.contains(marker)) {
            ready_tx.send_replace(true);
        }
        // Logs are informational; drop them rather than stall the reader
        let _ = events.try_send(ReceiverEvent::Log { stream, line });
    }
}

async fn probe_until_listening(port: u16) {
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(PORT_PROBE_INTERVAL).await;
    }
}

/// Read the metadata pipe for as long as the task lives
async fn read_metadata_pipe(path: PathBuf, events: mpsc::Sender<ReceiverEvent>) {
    let mut parser = MetadataParser::new();
    let mut assembler = TrackAssembler::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let mut pipe = match open_pipe_reader(&path) {
            Ok(pipe) => pipe,
            Err(e) => {
                tracing::debug!("Metadata pipe {} unavailable: {}", path.display(), e);
                tokio::time::sleep(METADATA_REOPEN_DELAY).await;
                continue;
            }
        };

        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Metadata pipe read failed: {}", e);
                    break;
                }
            };

            let text = String::from_utf8_lossy(&buf[..n]);
            for item in parser.feed(&text) {
                match item {
                    Ok(item) => {
                        if let Some(track) = assembler.apply(&item) {
                            if events.send(ReceiverEvent::Metadata(track)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Metadata parse error: {}", e);
                        let _ = events.try_send(ReceiverEvent::MetadataError(e.to_string()));
                    }
                }
            }
        }

        // Writer went away; wait for the next one
        tokio::time::sleep(METADATA_REOPEN_DELAY).await;
    }
}

#[cfg(unix)]
fn open_pipe_reader(path: &std::path::Path) -> std::io::Result<tokio::net::unix::pipe::Receiver> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

#[cfg(not(unix))]
fn open_pipe_reader(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("named pipes unsupported: {}", path.display()),
    ))
}

/// Kill receivers left over from a previous run
pub async fn kill_stale_receivers(launcher: &dyn ProcessLauncher, settings: &ReceiverSettings) {
    let Some(binary) = settings.binary.file_name() else {
        return;
    };
    let spec = ProcessSpec::new("killall").arg(binary.to_string_lossy().to_string());
    match launcher.run(spec).await {
        Ok(exit) => tracing::debug!("killall exited with {:?}", exit.code),
        Err(e) => tracing::debug!("killall unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::config::OutputMode;
    use crate::testing::{FakeLauncher, FakeProcessControl};

    fn setup(dir: &std::path::Path, ready_line: Option<&str>) -> (ReceiverConfig, ReceiverSettings) {
        let config = ReceiverConfig {
            name: "AirPlay to Den".into(),
            port: 5000,
            output_mode: OutputMode::Pipe,
            config_path: dir.join("receiver.conf"),
            audio_pipe: dir.join("audio"),
            metadata_pipe: dir.join("metadata"),
        };
        let settings = ReceiverSettings {
            ready_line: ready_line.map(String::from),
            probe_port: false,
            ready_timeout_ms: 300,
            stop_grace_ms: 100,
            ..ReceiverSettings::default()
        };
        (config, settings)
    }

    async fn started(
        launcher: &Arc<FakeLauncher>,
        dir: &std::path::Path,
    ) -> (ReceiverSupervisor, mpsc::Receiver<ReceiverEvent>, FakeProcessControl) {
        let (config, settings) = setup(dir, Some("listening"));
        let (tx, rx) = mpsc::channel(32);
        let mut supervisor = ReceiverSupervisor::new(config, settings, launcher.clone(), tx);

        let control = launcher.expect_process();
        control
            .write_stdout("starting up\nlistening on port 5000\n")
            .await;
        supervisor.start().await.unwrap();
        (supervisor, rx, control)
    }

    #[tokio::test]
    async fn test_start_waits_for_ready_line() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (supervisor, _rx, _control) = started(&launcher, dir.path()).await;

        assert!(supervisor.is_running());
        let spec = launcher.launched().pop().unwrap();
        assert_eq!(spec.args[0], "-c");
        assert!(dir.path().join("receiver.conf").exists());
    }

    #[tokio::test]
    async fn test_start_times_out_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (config, settings) = setup(dir.path(), Some("listening"));
        let (tx, _rx) = mpsc::channel(32);
        let mut supervisor = ReceiverSupervisor::new(config, settings, launcher.clone(), tx);

        let control = launcher.expect_process();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SessionError::ReceiverStartFailed(_)));
        assert_eq!(control.terminate_count(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_early_exit_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (config, settings) = setup(dir.path(), Some("listening"));
        let (tx, mut rx) = mpsc::channel(32);
        let mut supervisor = ReceiverSupervisor::new(config, settings, launcher.clone(), tx);

        let control = launcher.expect_process();
        control.exit(1);
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("before ready"));

        // Not reported as a crash
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ReceiverEvent::Crashed { .. }));
        }
    }

    #[tokio::test]
    async fn test_unexpected_exit_reports_crash() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (supervisor, mut rx, control) = started(&launcher, dir.path()).await;

        control.exit(139);
        loop {
            match rx.recv().await.unwrap() {
                ReceiverEvent::Crashed { code } => {
                    assert_eq!(code, Some(139));
                    break;
                }
                _ => continue,
            }
        }
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (mut supervisor, mut rx, control) = started(&launcher, dir.path()).await;

        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert_eq!(control.terminate_count(), 1);

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ReceiverEvent::Crashed { .. }));
        }
    }

    #[tokio::test]
    async fn test_log_lines_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (_supervisor, mut rx, control) = started(&launcher, dir.path()).await;

        control.write_stderr("connection from 10.0.0.7\n").await;
        loop {
            if let ReceiverEvent::Log { stream, line } = rx.recv().await.unwrap() {
                if stream == LogStream::Stderr {
                    assert_eq!(line, "connection from 10.0.0.7");
                    break;
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_metadata_from_pipe() {
        use base64::Engine;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let _pipe = crate::pipe::NamedPipe::create(dir.path().join("metadata")).unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let (_supervisor, mut rx, _control) = started(&launcher, dir.path()).await;

        let title = base64::engine::general_purpose::STANDARD.encode("Night Drive");
        let payload = format!(
            "<item><type>{}</type><code>{}</code><length>11</length>\n<data encoding=\"base64\">\n{}</data></item>\n\
             <item><type>{}</type><code>{}</code><length>0</length></item>\n",
            hex::encode("core"),
            hex::encode("minm"),
            title,
            hex::encode("ssnc"),
            hex::encode("mden"),
        );
        let path = dir.path().join("metadata");
        tokio::task::spawn_blocking(move || {
            let mut writer = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            writer.write_all(payload.as_bytes()).unwrap();
        })
        .await
        .unwrap();

        let track = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ReceiverEvent::Metadata(track) = rx.recv().await.unwrap() {
                    return track;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(track.title.as_deref(), Some("Night Drive"));
    }
}
