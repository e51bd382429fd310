use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::{ProcessId, TaskId};
use crate::pool::PoolStats;
use crate::process::ProcessState;

/// Point-in-time view of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStats {
    /// Started workers, idle or busy.
    pub live_processes: usize,
    pub spawning_processes: usize,
    pub idle_processes: usize,
    pub busy_processes: usize,
    pub max_processes: usize,
    /// Tasks waiting for a worker.
    pub queued_tasks: usize,
    /// Submitted tasks without a result yet, queued or running.
    pub pending_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Times a task went back to the queue because its worker exited.
    pub requeued_tasks: u64,
    pub task_pool: PoolStats,
    pub started_at: DateTime<Utc>,
}

impl ClusterStats {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

/// One registered worker as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub process_id: ProcessId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    /// The task the worker is running, if busy.
    pub task_id: Option<TaskId>,
}
