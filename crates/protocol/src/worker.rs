//! Worker-side lifecycle for processes spawned by the scheduler.
//!
//! Provides [`WorkerBuilder`] for fluent configuration and [`WorkerRunner`]
//! for running the request loop: announce readiness, execute dispatched tasks
//! one at a time, reply, and exit on `Shutdown` or when the host closes stdin.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame};
use crate::error::ProtocolError;
use crate::message::{HostMessage, TaskOutcome, TaskReply, TaskRequest, WorkerMessage};

// ── Task handler type ────────────────────────────────────────────────

/// Boxed async function that executes one task.
///
/// `Err(reason)` is reported to the host as a task failure; the worker keeps running.
pub type TaskHandler = Box<dyn Fn(TaskRequest) -> TaskFuture + Send + Sync>;

/// Future returned by a [`TaskHandler`].
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

// ── WorkerBuilder ────────────────────────────────────────────────────

/// Fluent builder for a [`WorkerRunnerConfig`].
///
/// # Example
/// ```ignore
/// let config = WorkerBuilder::new("square-worker")
///     .on_task(|req| async move {
///         let n = req.args.first().and_then(|v| v.as_i64()).ok_or("missing n")?;
///         Ok(serde_json::json!(n * n))
///     })
///     .build();
/// WorkerRunner::run_stdio(config).await?;
/// ```
pub struct WorkerBuilder {
    name: String,
    handler: Option<TaskHandler>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
        }
    }

    /// Register the task handler.
    pub fn on_task<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.handler = Some(Box::new(move |req| Box::pin(handler(req))));
        self
    }

    pub fn build(self) -> WorkerRunnerConfig {
        WorkerRunnerConfig {
            name: self.name,
            handler: self.handler,
        }
    }
}

// ── WorkerRunnerConfig ───────────────────────────────────────────────

/// Configuration produced by [`WorkerBuilder`], consumed by [`WorkerRunner`].
pub struct WorkerRunnerConfig {
    pub name: String,
    pub handler: Option<TaskHandler>,
}

// ── WorkerRunner ─────────────────────────────────────────────────────

/// Runs the worker side of the protocol.
pub struct WorkerRunner;

impl WorkerRunner {
    /// Run the request loop over arbitrary pipes.
    ///
    /// Returns the number of tasks handled. Without a handler every task is
    /// answered with a failure.
    pub async fn run<R, W>(
        config: WorkerRunnerConfig,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64, ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let name = config.name;
        write_frame(&mut writer, &WorkerMessage::ready()).await?;
        info!(worker = %name, "worker ready");

        let mut handled = 0u64;
        loop {
            let message: Option<HostMessage> = read_frame(&mut reader).await?;
            match message {
                Some(HostMessage::Dispatch(request)) => {
                    let task_id = request.task_id.clone();
                    debug!(
                        worker = %name,
                        task_id = %task_id,
                        label = %request.label,
                        "task received"
                    );

                    let outcome = match &config.handler {
                        Some(handler) => TaskOutcome::from(handler(request).await),
                        None => {
                            TaskOutcome::Failure(format!("worker '{name}' has no task handler"))
                        }
                    };
                    if !outcome.is_success() {
                        warn!(worker = %name, task_id = %task_id, "task failed");
                    }

                    let reply = WorkerMessage::Reply(TaskReply { task_id, outcome });
                    write_frame(&mut writer, &reply).await?;
                    handled += 1;
                }
                Some(HostMessage::Shutdown) => {
                    info!(worker = %name, handled, "shutdown requested");
                    break;
                }
                None => {
                    info!(worker = %name, handled, "host closed the pipe");
                    break;
                }
            }
        }

        Ok(handled)
    }

    /// Run the request loop on this process's stdin/stdout.
    ///
    /// Workers must keep stdout free of anything but frames; log to stderr.
    pub async fn run_stdio(config: WorkerRunnerConfig) -> Result<u64, ProtocolError> {
        Self::run(config, tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Tell the host this worker cannot start. The caller should exit afterwards.
    pub async fn refuse<W>(writer: &mut W, reason: impl Into<String>) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let reason = reason.into();
        warn!(reason = %reason, "refusing to start");
        write_frame(writer, &WorkerMessage::StartupFailed { reason }).await
    }
}
