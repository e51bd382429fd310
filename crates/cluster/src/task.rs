//! Task metadata and the queue of unassigned work.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::ClusterError;
use crate::id::{IdGenerator, TaskId};
use crate::pool::PoolStats;
use crate::queue::IndexedQueue;

struct TaskEntry {
    label: String,
    args: Vec<Value>,
    created_at: DateTime<Utc>,
    requeues: u32,
}

/// Owns every known task and the FIFO of tasks waiting for a worker.
///
/// A task stays registered from [`create_task`](Self::create_task) until
/// [`delete_task`](Self::delete_task), whether it is queued or assigned.
pub struct TaskManager {
    ids: IdGenerator,
    tasks: HashMap<TaskId, TaskEntry>,
    queue: IndexedQueue<TaskId>,
}

impl TaskManager {
    pub fn new(preallocated: usize, max: usize) -> Result<Self, ClusterError> {
        Ok(Self {
            ids: IdGenerator::default(),
            tasks: HashMap::new(),
            queue: IndexedQueue::with_bounds(preallocated, max)?,
        })
    }

    /// Register a task. It is not queued.
    pub fn create_task(&mut self, label: impl Into<String>, args: Vec<Value>) -> TaskId {
        let task_id = TaskId::from(self.ids.next_unique(|c| self.tasks.contains_key(c)));
        let label = label.into();
        debug!(task_id = %task_id, label = %label, "task created");
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                label,
                args,
                created_at: Utc::now(),
                requeues: 0,
            },
        );
        task_id
    }

    pub fn add_to_queue(&mut self, task_id: &TaskId) -> Result<(), ClusterError> {
        self.ensure_known(task_id)?;
        self.queue.add(task_id.clone())
    }

    pub fn get_next_task_id(&mut self) -> Option<TaskId> {
        self.queue.shift()
    }

    /// Forget a task, unqueueing it first if needed.
    pub fn delete_task(&mut self, task_id: &TaskId) -> Result<(), ClusterError> {
        self.ensure_known(task_id)?;
        if self.queue.contains(task_id) {
            self.queue.remove(task_id)?;
        }
        self.tasks.remove(task_id);
        Ok(())
    }

    /// Move a task to the back of the queue.
    pub fn requeue_task(&mut self, task_id: &TaskId) -> Result<(), ClusterError> {
        self.ensure_known(task_id)?;
        if self.queue.contains(task_id) {
            self.queue.remove(task_id)?;
        }
        self.queue.add(task_id.clone())?;
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.requeues += 1;
            debug!(task_id = %task_id, requeues = entry.requeues, "task requeued");
        }
        Ok(())
    }

    pub fn label(&self, task_id: &TaskId) -> Result<&str, ClusterError> {
        self.entry(task_id).map(|entry| entry.label.as_str())
    }

    /// A copy of the task's arguments.
    pub fn args(&self, task_id: &TaskId) -> Result<Vec<Value>, ClusterError> {
        self.entry(task_id).map(|entry| entry.args.clone())
    }

    pub fn created_at(&self, task_id: &TaskId) -> Result<DateTime<Utc>, ClusterError> {
        self.entry(task_id).map(|entry| entry.created_at)
    }

    /// How many times the task went back to the queue after its worker exited.
    pub fn requeues(&self, task_id: &TaskId) -> Result<u32, ClusterError> {
        self.entry(task_id).map(|entry| entry.requeues)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn is_queued(&self, task_id: &TaskId) -> bool {
        self.queue.contains(task_id)
    }

    /// Registered tasks, queued or not.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued tasks, oldest first.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.queue.iter().cloned().collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.queue.pool_stats()
    }

    fn entry(&self, task_id: &TaskId) -> Result<&TaskEntry, ClusterError> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| ClusterError::UnknownTask(task_id.to_string()))
    }

    fn ensure_known(&self, task_id: &TaskId) -> Result<(), ClusterError> {
        self.entry(task_id).map(|_| ())
    }
}
