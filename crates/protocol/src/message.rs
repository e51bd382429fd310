//! Messages exchanged between the scheduler host and a worker process.
//!
//! The host only ever sends [`HostMessage`] frames and the worker only ever
//! sends [`WorkerMessage`] frames. Task arguments and results are opaque
//! [`serde_json::Value`]s: the scheduler never looks inside them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version announced by the worker in its `Ready` frame.
pub const PROTOCOL_VERSION: u16 = 1;

/// One unit of work delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Identifier the worker must echo back in its reply.
    pub task_id: String,
    /// Instruction name, interpreted by the worker.
    pub label: String,
    /// Ordered arguments for the instruction.
    #[serde(default)]
    pub args: Vec<Value>,
    /// When the host handed this task to the worker.
    pub dispatched_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<String>, label: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            task_id: task_id.into(),
            label: label.into(),
            args,
            dispatched_at: Utc::now(),
        }
    }
}

/// Result of running a task on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(Value),
    Failure(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<Result<Value, String>> for TaskOutcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(reason) => Self::Failure(reason),
        }
    }
}

/// A worker's answer to a [`TaskRequest`], correlated by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    pub task_id: String,
    pub outcome: TaskOutcome,
}

/// Frames written by the host to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMessage {
    Dispatch(TaskRequest),
    /// Finish the current task (if any) and exit.
    Shutdown,
}

/// Frames written by a worker to its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Must be the first frame a worker writes.
    Ready { pid: u32, version: u16 },
    /// The worker could not initialize and is about to exit.
    StartupFailed { reason: String },
    Reply(TaskReply),
}

impl WorkerMessage {
    /// The `Ready` frame for the current process.
    pub fn ready() -> Self {
        Self::Ready {
            pid: std::process::id(),
            version: PROTOCOL_VERSION,
        }
    }
}
