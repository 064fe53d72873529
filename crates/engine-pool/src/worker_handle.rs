//! Spawns and speaks to one worker child process (spec §4.3 "A worker is a
//! child process that reads framed messages from its parent over a private
//! byte pipe").

use engine_common::model::WorkerId;
use engine_worker::protocol::{codec, WorkerEvent, WorkerRequest};
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerHandleError {
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(String),
    #[error("worker process exited unexpectedly with code {0:?}")]
    Crashed(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Draining,
    Dead,
}

pub struct WorkerHandle {
    pub id: WorkerId,
    child: Child,
    requests: mpsc::Sender<WorkerRequest>,
    events: mpsc::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    pub fn spawn(binary_path: &str, config_path: &str) -> Result<Self, WorkerHandleError> {
        let mut child = Command::new(binary_path)
            .env("ENGINE_WORKER_CONFIG", config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerHandleError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>(16);
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(256);

        tokio::spawn(writer_task(stdin, request_rx));
        tokio::spawn(reader_task(stdout, event_tx));

        Ok(Self {
            id: WorkerId::new(),
            child,
            requests: request_tx,
            events: event_rx,
        })
    }

    pub async fn send(&self, request: WorkerRequest) {
        let _ = self.requests.send(request).await;
    }

    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Platform "terminate" signal: SIGTERM on Unix. The pool's soft
    /// escalation step (spec §4.4 "Timeout enforcement").
    #[cfg(unix)]
    pub fn terminate(&self) {
        if let Some(pid) = self.pid() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Platform "kill" signal: SIGKILL. The pool's hard escalation step.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    pub async fn try_wait_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(stdin: W, mut requests: mpsc::Receiver<WorkerRequest>) {
    let mut writer = FramedWrite::new(stdin, codec());
    while let Some(request) = requests.recv().await {
        let Ok(bytes) = serde_json::to_vec(&request) else {
            continue;
        };
        if writer.send(bytes.into()).await.is_err() {
            break;
        }
    }
}

async fn reader_task<R: AsyncRead + Unpin>(stdout: R, events: mpsc::Sender<WorkerEvent>) {
    let mut reader = FramedRead::new(stdout, codec());
    while let Some(Ok(frame)) = reader.next().await {
        let Ok(event) = serde_json::from_slice::<WorkerEvent>(&frame) else {
            continue;
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
