//! External process capability
//!
//! The receiver and the transcoder are both long-running child processes.
//! They are reached through [`ProcessLauncher`] so sessions can run against
//! fakes in tests without spawning real binaries.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::error::ProcessError;

/// Byte stream from a child's stdout or stderr
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running child process
#[async_trait]
pub trait ExternalProcess: Send {
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<ProcessOutput>;

    fn take_stderr(&mut self) -> Option<ProcessOutput>;

    /// Wait for exit. Cancel-safe.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Ask the process to exit, force-killing it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> std::io::Result<ProcessExit>;
}

/// Spawns external processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: ProcessSpec) -> Result<Box<dyn ExternalProcess>, ProcessError>;

    /// Run a short command to completion, discarding output.
    async fn run(&self, spec: ProcessSpec) -> Result<ProcessExit, ProcessError>;
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

impl TokioLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: ProcessSpec) -> Result<Box<dyn ExternalProcess>, ProcessError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed {
                program: spec.program_name(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Spawned {} (pid {:?})", spec.program_name(), child.id());
        Ok(Box::new(TokioProcess { child }))
    }

    async fn run(&self, spec: ProcessSpec) -> Result<ProcessExit, ProcessError> {
        let status = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ProcessError::SpawnFailed {
                program: spec.program_name(),
                reason: e.to_string(),
            })?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }
}

/// A `tokio::process::Child`
pub struct TokioProcess {
    child: Child,
}

#[async_trait]
impl ExternalProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as ProcessOutput)
    }

    fn take_stderr(&mut self) -> Option<ProcessOutput> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as ProcessOutput)
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    async fn terminate(&mut self, grace: Duration) -> std::io::Result<ProcessExit> {
        if let Some(exit) = self.child.try_wait()? {
            return Ok(ProcessExit { code: exit.code() });
        }

        if let Some(pid) = self.child.id() {
            if let Err(e) = send_sigterm(pid) {
                tracing::debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(ProcessExit {
                code: status?.code(),
            }),
            Err(_) => {
                tracing::warn!("Process {:?} ignored SIGTERM, killing", self.child.id());
                self.child.kill().await?;
                let status = self.child.wait().await?;
                Ok(ProcessExit {
                    code: status.code(),
                })
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| ProcessError::SignalFailed {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) -> Result<(), ProcessError> {
    Err(ProcessError::SignalFailed {
        pid,
        reason: "signals unsupported on this platform".to_string(),
    })
}
