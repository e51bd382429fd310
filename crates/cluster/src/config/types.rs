use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a cluster.
///
/// Parsed from `smart-cluster.toml` with support for environment variable
/// overrides. Scheduling limits sit at the top level and the worker program
/// under `[worker]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Workers started when the cluster comes up.
    #[serde(default = "default_num_processes")]
    pub num_processes: usize,

    /// Hard cap on live plus spawning workers. Defaults to `num_processes`.
    #[serde(default)]
    pub max_processes: Option<usize>,

    /// Task queue nodes allocated up front and kept for reuse.
    #[serde(default = "default_preallocated_tasks")]
    pub preallocated_tasks: usize,

    /// Most tasks that may wait in the queue at once.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Times a task may go back to the queue after its worker exits before
    /// it fails. Unset means no limit.
    #[serde(default)]
    pub max_requeues: Option<u32>,

    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_num_processes() -> usize {
    4
}

fn default_preallocated_tasks() -> usize {
    64
}

fn default_max_tasks() -> usize {
    1024
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_processes: default_num_processes(),
            max_processes: None,
            preallocated_tasks: default_preallocated_tasks(),
            max_tasks: default_max_tasks(),
            max_requeues: None,
            worker: WorkerConfig::default(),
        }
    }
}

// ── Section configs ─────────────────────────────────────────────────

/// The program every worker runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the worker binary, or a name resolved through `PATH`.
    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables passed to each worker.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long a worker may take to announce it is ready.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_program() -> String {
    "echo-worker".into()
}

fn default_ready_timeout_secs() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            env: HashMap::new(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

// ── Scheduling limits ───────────────────────────────────────────────

/// The launcher-independent part of [`ClusterConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterSettings {
    pub num_processes: usize,
    pub max_processes: usize,
    pub preallocated_tasks: usize,
    pub max_tasks: usize,
    pub max_requeues: Option<u32>,
}
