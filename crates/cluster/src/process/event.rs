use serde::Serialize;
use smart_cluster_protocol::TaskReply;

use crate::id::ProcessId;

/// Lifecycle state of a registered worker process.
///
/// An exited process is no longer registered, so it has no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Launched, waiting for its `Ready` frame.
    Spawning,
    /// Started (or just taken off the idle queue) but neither idle nor busy.
    Ready,
    Idle,
    Busy,
}

/// Raw notification from a worker's I/O tasks to its [`ProcessManager`](super::ProcessManager).
#[derive(Debug)]
pub enum WorkerSignal {
    Message {
        process_id: ProcessId,
        reply: TaskReply,
    },
    Exited {
        process_id: ProcessId,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Spawned,
    Message,
    Exited,
}

/// Lifecycle event delivered to the manager's subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The worker is ready and may be queued or assigned immediately.
    Spawned { process_id: ProcessId },
    /// The worker answered a task.
    Message {
        process_id: ProcessId,
        reply: TaskReply,
    },
    /// The worker terminated. It is already gone from the registry and idle queue.
    Exited {
        process_id: ProcessId,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ProcessEvent {
    pub fn kind(&self) -> ProcessEventKind {
        match self {
            Self::Spawned { .. } => ProcessEventKind::Spawned,
            Self::Message { .. } => ProcessEventKind::Message,
            Self::Exited { .. } => ProcessEventKind::Exited,
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        match self {
            Self::Spawned { process_id }
            | Self::Message { process_id, .. }
            | Self::Exited { process_id, .. } => process_id,
        }
    }
}
