//! Starting worker processes and moving frames to and from them.
//!
//! [`WorkerLauncher`] is the seam between the [`ProcessManager`](super::ProcessManager)
//! and the OS. [`CommandLauncher`] runs a program with piped stdio and speaks
//! the frame protocol over it; tests substitute the mock in
//! [`crate::testing`].

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use smart_cluster_protocol::{
    read_frame, write_frame, HostMessage, TaskRequest, WorkerMessage, PROTOCOL_VERSION,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::ClusterError;
use crate::id::ProcessId;

use super::event::WorkerSignal;

/// Environment variable carrying the scheduler-assigned process id into the worker.
pub const PROCESS_ID_ENV: &str = "SMART_CLUSTER_PROCESS_ID";

/// How long an orphaned worker may take to exit after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for buffered replies after the worker exits.
const READER_DRAIN: Duration = Duration::from_secs(2);

// ── Traits ───────────────────────────────────────────────────────────

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and resolve once it is ready to take tasks.
    ///
    /// Replies and the eventual exit of the worker must be reported on `signals`,
    /// with the exit reported last.
    async fn launch(
        &self,
        process_id: ProcessId,
        signals: UnboundedSender<WorkerSignal>,
    ) -> Result<Box<dyn WorkerHandle>, ClusterError>;
}

/// Host-side handle to one running worker.
///
/// Dropping the handle releases the worker: its input is closed and it is
/// expected to exit on its own.
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Queue a task for delivery. Never waits for the worker.
    fn send(&mut self, request: TaskRequest) -> Result<(), ClusterError>;

    /// Ask the worker to finish and exit.
    fn request_shutdown(&mut self) -> Result<(), ClusterError>;

    /// Terminate the worker. Its exit is still reported through the signal channel.
    fn kill(&mut self) -> Result<(), ClusterError>;
}

// ── CommandLauncher ──────────────────────────────────────────────────

/// Launches workers as child processes speaking the frame protocol on stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    ready_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            ready_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(
        &self,
        process_id: ProcessId,
        signals: UnboundedSender<WorkerSignal>,
    ) -> Result<Box<dyn WorkerHandle>, ClusterError> {
        let spawn_error = |reason: String| ClusterError::SpawnError {
            process_id: process_id.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env(PROCESS_ID_ENV, process_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("failed to run '{}': {e}", self.program)))?;

        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            abort(&mut child).await;
            return Err(spawn_error("worker stdio was not captured".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(process_id.clone(), stderr);
        }

        let ready = tokio::time::timeout(
            self.ready_timeout,
            read_frame::<_, WorkerMessage>(&mut stdout),
        )
        .await;
        let reason = match ready {
            Ok(Ok(Some(WorkerMessage::Ready { version, .. }))) if version == PROTOCOL_VERSION => {
                None
            }
            Ok(Ok(Some(WorkerMessage::Ready { version, .. }))) => Some(format!(
                "worker speaks protocol v{version}, expected v{PROTOCOL_VERSION}"
            )),
            Ok(Ok(Some(WorkerMessage::StartupFailed { reason }))) => Some(reason),
            Ok(Ok(Some(WorkerMessage::Reply(_)))) => {
                Some("worker replied before announcing ready".into())
            }
            Ok(Ok(None)) => Some(match child.wait().await {
                Ok(status) => format!("worker exited before ready ({status})"),
                Err(e) => format!("worker closed stdout before ready: {e}"),
            }),
            Ok(Err(e)) => Some(format!("unreadable ready frame: {e}")),
            Err(_) => Some(format!("worker not ready after {:?}", self.ready_timeout)),
        };
        if let Some(reason) = reason {
            abort(&mut child).await;
            return Err(spawn_error(reason));
        }

        let pid = child.id();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(process_id.clone(), stdin, outbox_rx));
        let reader = tokio::spawn(read_loop(process_id.clone(), stdout, signals.clone()));
        tokio::spawn(watch(process_id.clone(), child, kill_rx, reader, signals));

        info!(process_id = %process_id, pid = ?pid, program = %self.program, "worker ready");
        Ok(Box::new(CommandWorker {
            process_id,
            pid,
            outbox: outbox_tx,
            kill: kill_tx,
        }))
    }
}

// ── CommandWorker ────────────────────────────────────────────────────

struct CommandWorker {
    process_id: ProcessId,
    pid: Option<u32>,
    outbox: UnboundedSender<HostMessage>,
    kill: UnboundedSender<()>,
}

impl CommandWorker {
    fn unavailable(&self) -> ClusterError {
        ClusterError::WorkerUnavailable(self.process_id.to_string())
    }
}

impl WorkerHandle for CommandWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, request: TaskRequest) -> Result<(), ClusterError> {
        self.outbox
            .send(HostMessage::Dispatch(request))
            .map_err(|_| self.unavailable())
    }

    fn request_shutdown(&mut self) -> Result<(), ClusterError> {
        self.outbox
            .send(HostMessage::Shutdown)
            .map_err(|_| self.unavailable())
    }

    fn kill(&mut self) -> Result<(), ClusterError> {
        self.kill.send(()).map_err(|_| self.unavailable())
    }
}

// ── I/O tasks ────────────────────────────────────────────────────────

/// Drain the outbox into the worker's stdin. Closing the outbox closes stdin.
async fn write_loop(
    process_id: ProcessId,
    mut stdin: ChildStdin,
    mut outbox: UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = write_frame(&mut stdin, &message).await {
            // The worker is gone or closed its input; its exit will follow.
            warn!(process_id = %process_id, error = %e, "failed to write to worker");
            break;
        }
    }
    debug!(process_id = %process_id, "worker input closed");
}

enum ReadEnd {
    Eof,
    Malformed,
    HostGone,
}

/// Forward replies from the worker's stdout until EOF.
async fn read_loop(
    process_id: ProcessId,
    mut stdout: ChildStdout,
    signals: UnboundedSender<WorkerSignal>,
) -> ReadEnd {
    loop {
        match read_frame::<_, WorkerMessage>(&mut stdout).await {
            Ok(Some(WorkerMessage::Reply(reply))) => {
                let signal = WorkerSignal::Message {
                    process_id: process_id.clone(),
                    reply,
                };
                if signals.send(signal).is_err() {
                    return ReadEnd::HostGone;
                }
            }
            Ok(Some(other)) => {
                warn!(
                    process_id = %process_id,
                    message = ?other,
                    "ignoring unexpected worker frame"
                );
            }
            Ok(None) => return ReadEnd::Eof,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "malformed frame from worker");
                return ReadEnd::Malformed;
            }
        }
    }
}

enum WatchStep {
    Exited(std::io::Result<ExitStatus>),
    KillRequested,
    Released,
    ReaderDone(Option<ReadEnd>),
    GraceElapsed,
}

/// Own the child until it exits, then report the exit after the reader drains.
async fn watch(
    process_id: ProcessId,
    mut child: Child,
    mut kill_rx: UnboundedReceiver<()>,
    mut reader: JoinHandle<ReadEnd>,
    signals: UnboundedSender<WorkerSignal>,
) {
    let mut released = false;
    let mut reader_done = false;
    let mut grace_deadline: Option<Instant> = None;

    let status = loop {
        let deadline = grace_deadline.unwrap_or_else(Instant::now);
        let step = tokio::select! {
            status = child.wait() => WatchStep::Exited(status),
            request = kill_rx.recv(), if !released => match request {
                Some(()) => WatchStep::KillRequested,
                None => WatchStep::Released,
            },
            end = &mut reader, if !reader_done => WatchStep::ReaderDone(end.ok()),
            _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                WatchStep::GraceElapsed
            }
        };

        match step {
            WatchStep::Exited(status) => break status,
            WatchStep::KillRequested => {
                debug!(process_id = %process_id, "killing worker");
                start_kill(&process_id, &mut child);
            }
            WatchStep::Released => {
                released = true;
                grace_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
            }
            WatchStep::ReaderDone(end) => {
                reader_done = true;
                if matches!(end, Some(ReadEnd::Malformed)) {
                    start_kill(&process_id, &mut child);
                }
            }
            WatchStep::GraceElapsed => {
                grace_deadline = None;
                warn!(process_id = %process_id, "released worker did not exit, killing");
                start_kill(&process_id, &mut child);
            }
        }
    };

    if !reader_done && tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
        warn!(process_id = %process_id, "worker stdout still open after exit");
        reader.abort();
    }

    let (code, signal) = match &status {
        Ok(status) => (status.code(), exit_signal(status)),
        Err(e) => {
            warn!(process_id = %process_id, error = %e, "failed to collect worker exit status");
            (None, None)
        }
    };
    debug!(process_id = %process_id, code = ?code, signal = ?signal, "worker exited");

    let _ = signals.send(WorkerSignal::Exited {
        process_id,
        code,
        signal,
    });
}

/// Pipe worker stderr into the host log, one event per line.
fn forward_stderr(process_id: ProcessId, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(process_id = %process_id, "{line}");
        }
    });
}

fn start_kill(process_id: &ProcessId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(process_id = %process_id, error = %e, "failed to kill worker");
    }
}

async fn abort(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
