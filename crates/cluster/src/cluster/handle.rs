use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::{ClusterConfig, ClusterSettings};
use crate::error::ClusterError;
use crate::id::{ProcessId, TaskId};
use crate::process::{CommandLauncher, SpawnOutcome, WorkerLauncher};

use super::engine::{ClusterCore, Completion, SpawnReply};
use super::stats::{ClusterStats, ProcessInfo};

enum Command {
    Submit {
        label: String,
        args: Vec<Value>,
        completion: Completion,
        reply: oneshot::Sender<Result<TaskId, ClusterError>>,
    },
    SpawnProcess {
        reply: SpawnReply,
    },
    KillProcess {
        process_id: ProcessId,
        reply: oneshot::Sender<Result<(), ClusterError>>,
    },
    Stats {
        reply: oneshot::Sender<ClusterStats>,
    },
    Processes {
        reply: oneshot::Sender<Vec<ProcessInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running cluster. Cheap to clone.
///
/// All scheduler state lives in one background task; every method is a
/// message to it. When the last handle is dropped the loop stops, rejects
/// pending tasks and releases its workers.
#[derive(Clone)]
pub struct SmartCluster {
    commands: UnboundedSender<Command>,
}

impl SmartCluster {
    /// Start a cluster running `config.worker.program`.
    ///
    /// Must be called within a Tokio runtime. Returns before the workers are
    /// ready; tasks submitted meanwhile wait in the queue.
    pub fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        let launcher = CommandLauncher::from_config(&config.worker);
        info!(
            program = %launcher.program(),
            workers = config.num_processes,
            "starting cluster"
        );
        Self::start_with_launcher(Arc::new(launcher), config.settings())
    }

    /// Start a cluster on any [`WorkerLauncher`].
    pub fn start_with_launcher(
        launcher: Arc<dyn WorkerLauncher>,
        settings: ClusterSettings,
    ) -> Result<Self, ClusterError> {
        let mut core = ClusterCore::new(launcher, settings)?;
        for _ in 0..settings.num_processes {
            core.start_spawn(None);
        }

        let (commands, inbox) = mpsc::unbounded_channel();
        tokio::spawn(run(core, inbox));
        Ok(Self { commands })
    }

    /// Submit a task. Resolves once it is accepted; await the returned handle for its result.
    ///
    /// Fails with `CapacityExceeded` when the task queue is full.
    pub async fn submit_task(
        &self,
        label: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<TaskHandle, ClusterError> {
        let (completion, result) = oneshot::channel();
        let label = label.into();
        let task_id = self
            .request(|reply| Command::Submit {
                label,
                args,
                completion,
                reply,
            })
            .await??;
        Ok(TaskHandle { task_id, result })
    }

    /// Grow the pool by one worker and wait for it to be ready.
    pub async fn spawn_process(&self) -> Result<ProcessId, ClusterError> {
        self.request(|reply| Command::SpawnProcess { reply }).await?
    }

    /// Terminate a worker. Its task, if any, is requeued.
    pub async fn kill_process(&self, process_id: &ProcessId) -> Result<(), ClusterError> {
        let process_id = process_id.clone();
        self.request(|reply| Command::KillProcess { process_id, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<ClusterStats, ClusterError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Every registered worker with its state and current task.
    pub async fn processes(&self) -> Result<Vec<ProcessInfo>, ClusterError> {
        self.request(|reply| Command::Processes { reply }).await
    }

    /// Reject pending tasks, kill every worker and stop the loop.
    ///
    /// Calling it on a stopped cluster is a no-op.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(ClusterError::Shutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClusterError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ClusterError::Shutdown)?;
        response.await.map_err(|_| ClusterError::Shutdown)
    }
}

/// Completion of one submitted task.
///
/// Resolves to the worker's result, `TaskFailed` when the worker reported an
/// error, or `Shutdown` when the cluster stopped first.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    result: oneshot::Receiver<Result<Value, ClusterError>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, ClusterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClusterError::Shutdown)))
    }
}

// ── Event loop ──────────────────────────────────────────────────────

enum Step {
    Command(Command),
    Released,
    Signal,
    Spawned(SpawnOutcome),
}

async fn run(mut core: ClusterCore, mut inbox: UnboundedReceiver<Command>) {
    loop {
        let step = tokio::select! {
            command = inbox.recv() => match command {
                Some(command) => Step::Command(command),
                None => Step::Released,
            },
            () = core.processes.pump() => Step::Signal,
            Some(outcome) = core.spawn_rx.recv() => Step::Spawned(outcome),
        };

        match step {
            Step::Command(command) => {
                if let Some(reply) = handle_command(&mut core, command) {
                    inbox.close();
                    core.shutdown();
                    let _ = reply.send(());
                    return;
                }
            }
            Step::Released => {
                debug!("all cluster handles dropped");
                core.release();
                return;
            }
            Step::Signal => {}
            Step::Spawned(outcome) => core.finish_spawn(outcome),
        }
        core.drain_events();
    }
}

/// Apply a command. A shutdown request is handed back to the loop.
fn handle_command(core: &mut ClusterCore, command: Command) -> Option<oneshot::Sender<()>> {
    match command {
        Command::Submit {
            label,
            args,
            completion,
            reply,
        } => {
            let _ = reply.send(core.submit(label, args, completion));
        }
        Command::SpawnProcess { reply } => core.start_spawn(Some(reply)),
        Command::KillProcess { process_id, reply } => {
            let _ = reply.send(core.kill_process(&process_id));
        }
        Command::Stats { reply } => {
            let _ = reply.send(core.stats());
        }
        Command::Processes { reply } => {
            let _ = reply.send(core.process_infos());
        }
        Command::Shutdown { reply } => return Some(reply),
    }
    None
}
