//! Receiver audio -> transcoder -> live stream
//!
//! The relay owns one transcoder process. Its stdout is read in fixed-size
//! chunks and published as it arrives, so memory use stays bounded by the
//! chunk size and the hub's channel capacity.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::process::{ExternalProcess, ProcessLauncher, ProcessOutput, ProcessSpec};
use crate::relay::hub::LivePublisher;

/// Transcoder stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// First chunk reached at least one listener
    StreamingStarted,
    /// Source closed and the transcoder exited cleanly
    StreamingEnded,
    Failed(String),
}

pub struct StreamRelay {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StreamRelay {
    /// Launch the transcoder and start pumping its output to `publisher`
    pub async fn start(
        launcher: &dyn ProcessLauncher,
        spec: ProcessSpec,
        publisher: LivePublisher,
        chunk_size: usize,
        grace: Duration,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Self, SessionError> {
        let mut process = launcher
            .launch(spec)
            .await
            .map_err(|e| SessionError::RelayFailed(e.to_string()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| SessionError::RelayFailed("transcoder has no stdout".into()))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(collect_stderr(stderr, tail.clone()));
        }

        tracing::debug!("Relay for {} started (pid {:?})", publisher.stream_id(), process.id());
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            process,
            stdout,
            publisher,
            chunk_size.max(1),
            grace,
            tail,
            stop_rx,
            events,
        ));

        Ok(Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the transcoder without emitting further events. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    mut process: Box<dyn ExternalProcess>,
    mut stdout: ProcessOutput,
    publisher: LivePublisher,
    chunk_size: usize,
    grace: Duration,
    tail: Arc<Mutex<VecDeque<String>>>,
    mut stop_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut started = false;

    let read_error = loop {
        let n = tokio::select! {
            _ = &mut stop_rx => {
                if let Err(e) = process.terminate(grace).await {
                    tracing::debug!("Stopping transcoder: {}", e);
                }
                return;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(e.to_string()),
            },
        };

        let listeners = publisher.publish(Bytes::copy_from_slice(&buf[..n]));
        if !started && listeners > 0 {
            started = true;
            tracing::info!("Streaming {} to {} listener(s)", publisher.stream_id(), listeners);
            let _ = events.send(RelayEvent::StreamingStarted).await;
        }
    };

    let exit = tokio::select! {
        _ = &mut stop_rx => {
            let _ = process.terminate(grace).await;
            return;
        }
        exit = async {
            if read_error.is_some() {
                process.terminate(grace).await
            } else {
                process.wait().await
            }
        } => exit,
    };

    let event = match (read_error, exit) {
        (None, Ok(exit)) if exit.success() => RelayEvent::StreamingEnded,
        (Some(e), _) => RelayEvent::Failed(format!("reading transcoder output: {}", e)),
        (None, Ok(exit)) => RelayEvent::Failed(format!(
            "transcoder exited with {:?}: {}",
            exit.code,
            tail.lock().iter().cloned().collect::<Vec<_>>().join(" | ")
        )),
        (None, Err(e)) => RelayEvent::Failed(format!("waiting for transcoder: {}", e)),
    };
    match &event {
        RelayEvent::StreamingEnded => tracing::info!("Stream {} ended", publisher.stream_id()),
        RelayEvent::Failed(reason) => tracing::error!("Relay {} failed: {}", publisher.stream_id(), reason),
        RelayEvent::StreamingStarted => {}
    }
    let _ = events.send(event).await;
}

async fn collect_stderr(stderr: ProcessOutput, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "transcoder", "{}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
