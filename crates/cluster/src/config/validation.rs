use crate::error::ClusterError;

use super::types::{ClusterConfig, ClusterSettings};

impl ClusterConfig {
    /// Validate limits and the worker section.
    pub fn validate(&self) -> Result<(), ClusterError> {
        self.settings().validate()?;
        self.validate_worker()?;
        Ok(())
    }

    fn validate_worker(&self) -> Result<(), ClusterError> {
        if self.worker.program.trim().is_empty() {
            return Err(ClusterError::InvalidConfiguration(
                "worker.program must not be empty".into(),
            ));
        }
        if self.worker.ready_timeout_secs == 0 {
            return Err(ClusterError::InvalidConfiguration(
                "worker.ready_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl ClusterSettings {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.num_processes == 0 {
            return Err(ClusterError::InvalidConfiguration(
                "num_processes must be at least 1".into(),
            ));
        }
        if self.max_processes < self.num_processes {
            return Err(ClusterError::InvalidConfiguration(format!(
                "max_processes ({}) must be >= num_processes ({})",
                self.max_processes, self.num_processes
            )));
        }
        if self.max_tasks < self.preallocated_tasks {
            return Err(ClusterError::InvalidConfiguration(format!(
                "max_tasks ({}) must be >= preallocated_tasks ({})",
                self.max_tasks, self.preallocated_tasks
            )));
        }
        Ok(())
    }
}
