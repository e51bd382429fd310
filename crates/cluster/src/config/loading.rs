use std::path::Path;

use crate::error::ClusterError;

use super::types::{ClusterConfig, ClusterSettings, WorkerConfig};

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl ClusterConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ClusterError> {
        Self::parse_with(toml_str, env_lookup)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        Self::load_with(path, env_lookup)
    }

    pub(crate) fn parse_with(
        toml_str: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClusterError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn load_with(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse_with(&content, lookup)
    }

    /// Defaults with `num_processes` workers running `program`.
    pub fn local(program: impl Into<String>, num_processes: usize) -> Self {
        Self {
            num_processes,
            worker: WorkerConfig {
                program: program.into(),
                ..WorkerConfig::default()
            },
            ..Self::default()
        }
    }

    /// The effective process cap.
    pub fn max_processes(&self) -> usize {
        self.max_processes.unwrap_or(self.num_processes)
    }

    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            num_processes: self.num_processes,
            max_processes: self.max_processes(),
            preallocated_tasks: self.preallocated_tasks,
            max_tasks: self.max_tasks,
            max_requeues: self.max_requeues,
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `SMART_CLUSTER_NUM_PROCESSES` -> `num_processes`
    /// - `SMART_CLUSTER_MAX_PROCESSES` -> `max_processes`
    /// - `SMART_CLUSTER_PREALLOCATED_TASKS` -> `preallocated_tasks`
    /// - `SMART_CLUSTER_MAX_TASKS` -> `max_tasks`
    /// - `SMART_CLUSTER_MAX_REQUEUES` -> `max_requeues`
    /// - `SMART_CLUSTER_WORKER_PROGRAM` -> `worker.program`
    /// - `SMART_CLUSTER_READY_TIMEOUT_SECS` -> `worker.ready_timeout_secs`
    ///
    /// Numbers that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(env_lookup);
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(n) = number("SMART_CLUSTER_NUM_PROCESSES") {
            self.num_processes = n;
        }
        if let Some(n) = number("SMART_CLUSTER_MAX_PROCESSES") {
            self.max_processes = Some(n);
        }
        if let Some(n) = number("SMART_CLUSTER_PREALLOCATED_TASKS") {
            self.preallocated_tasks = n;
        }
        if let Some(n) = number("SMART_CLUSTER_MAX_TASKS") {
            self.max_tasks = n;
        }
        if let Some(n) =
            lookup("SMART_CLUSTER_MAX_REQUEUES").and_then(|v| v.trim().parse::<u32>().ok())
        {
            self.max_requeues = Some(n);
        }
        if let Some(v) = lookup("SMART_CLUSTER_WORKER_PROGRAM") {
            self.worker.program = v;
        }
        if let Some(secs) =
            lookup("SMART_CLUSTER_READY_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.worker.ready_timeout_secs = secs;
        }
    }
}

impl ClusterSettings {
    /// `num_processes` workers, capped at the same number, with default task limits.
    pub fn new(num_processes: usize) -> Self {
        let defaults = ClusterConfig::default();
        Self {
            num_processes,
            max_processes: num_processes,
            preallocated_tasks: defaults.preallocated_tasks,
            max_tasks: defaults.max_tasks,
            max_requeues: None,
        }
    }

    pub fn max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn task_bounds(mut self, preallocated: usize, max: usize) -> Self {
        self.preallocated_tasks = preallocated;
        self.max_tasks = max;
        self
    }

    /// Fail a task once its workers have exited under it `limit + 1` times.
    pub fn max_requeues(mut self, limit: u32) -> Self {
        self.max_requeues = Some(limit);
        self
    }
}
