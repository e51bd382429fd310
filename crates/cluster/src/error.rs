use thiserror::Error;

/// Errors raised by the scheduling engine.
///
/// `DuplicateMember`, `NotFound`, `UnknownProcess` and `UnknownTask` mean a
/// caller broke a registry contract. `CapacityExceeded` is backpressure and
/// is safe to retry later.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("'{0}' is already queued")]
    DuplicateMember(String),

    #[error("'{0}' is not queued")]
    NotFound(String),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("capacity exceeded: limit of {max} reached")]
    CapacityExceeded { max: usize },

    #[error("worker {process_id} failed to start: {reason}")]
    SpawnError { process_id: String, reason: String },

    #[error("reply from process {process_id} references task {task_id} with no pending entry")]
    OrphanedReply { process_id: String, task_id: String },

    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    #[error("worker {0} is no longer accepting messages")]
    WorkerUnavailable(String),

    #[error("cluster is shut down")]
    Shutdown,

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Whether the error is a backpressure signal rather than a failure.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
