//! Worker-process pool scheduler.
//!
//! [`SmartCluster`] runs a fixed set of worker processes, hands each one task
//! at a time, queues the rest in FIFO order and requeues work whose worker
//! exits mid-task. Workers speak the frame protocol from
//! `smart-cluster-protocol` over stdio.

pub mod cluster;
pub mod config;
pub mod error;
pub mod id;
pub mod pool;
pub mod process;
pub mod queue;
pub mod task;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cluster::{ClusterStats, ProcessInfo, SmartCluster, TaskHandle};
pub use config::{ClusterConfig, ClusterSettings, WorkerConfig};
pub use error::ClusterError;
pub use id::{IdGenerator, ProcessId, TaskId};
pub use pool::{ObjectPool, PoolStats};
pub use process::{
    CommandLauncher, ProcessEvent, ProcessManager, ProcessState, WorkerHandle, WorkerLauncher,
    PROCESS_ID_ENV,
};
pub use queue::IndexedQueue;
pub use task::TaskManager;
