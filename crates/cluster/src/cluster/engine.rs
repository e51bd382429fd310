//! Scheduler state owned by the cluster's event loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use smart_cluster_protocol::{TaskOutcome, TaskReply};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterSettings;
use crate::error::ClusterError;
use crate::id::{ProcessId, TaskId};
use crate::process::{ProcessEvent, ProcessManager, ProcessState, SpawnOutcome, WorkerLauncher};
use crate::task::TaskManager;

use super::stats::{ClusterStats, ProcessInfo};

pub(crate) type Completion = oneshot::Sender<Result<Value, ClusterError>>;
pub(crate) type SpawnReply = oneshot::Sender<Result<ProcessId, ClusterError>>;

struct Launch {
    task: JoinHandle<()>,
    reply: Option<SpawnReply>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    failed: u64,
    requeued: u64,
}

/// Binds queued tasks to idle workers.
///
/// Every busy worker has exactly one entry in `assignments`, and every
/// submitted task that has not finished has exactly one entry in `pending`.
pub(crate) struct ClusterCore {
    pub(super) processes: ProcessManager,
    tasks: TaskManager,
    events: UnboundedReceiver<ProcessEvent>,
    assignments: HashMap<ProcessId, TaskId>,
    pending: HashMap<TaskId, Completion>,
    launches: HashMap<ProcessId, Launch>,
    spawn_tx: UnboundedSender<SpawnOutcome>,
    pub(super) spawn_rx: UnboundedReceiver<SpawnOutcome>,
    counters: Counters,
    max_requeues: Option<u32>,
    started_at: DateTime<Utc>,
}

impl ClusterCore {
    /// Build the managers and subscribe before any worker can report in.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        settings: ClusterSettings,
    ) -> Result<Self, ClusterError> {
        settings.validate()?;

        let mut processes =
            ProcessManager::new(launcher, settings.num_processes, settings.max_processes)?;
        let events = processes.subscribe();
        let tasks = TaskManager::new(settings.preallocated_tasks, settings.max_tasks)?;
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();

        Ok(Self {
            processes,
            tasks,
            events,
            assignments: HashMap::new(),
            pending: HashMap::new(),
            launches: HashMap::new(),
            spawn_tx,
            spawn_rx,
            counters: Counters::default(),
            max_requeues: settings.max_requeues,
            started_at: Utc::now(),
        })
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Register a task and hand it to an idle worker, or queue it.
    ///
    /// On `CapacityExceeded` nothing about the task is retained.
    pub fn submit(
        &mut self,
        label: String,
        args: Vec<Value>,
        completion: Completion,
    ) -> Result<TaskId, ClusterError> {
        let task_id = self.tasks.create_task(label, args);
        self.pending.insert(task_id.clone(), completion);

        match self.processes.get_next_process_id() {
            Some(process_id) => self.assign(process_id, task_id.clone()),
            None => {
                if let Err(e) = self.tasks.add_to_queue(&task_id) {
                    self.pending.remove(&task_id);
                    self.discard_task(&task_id);
                    warn!(task_id = %task_id, error = %e, "task rejected");
                    return Err(e);
                }
                debug!(task_id = %task_id, queued = self.tasks.queued_len(), "task queued");
            }
        }
        Ok(task_id)
    }

    // ── Spawning ────────────────────────────────────────────────────

    /// Start a worker in the background. The result arrives on `spawn_rx`.
    pub fn start_spawn(&mut self, reply: Option<SpawnReply>) {
        let pending = match self.processes.begin_spawn() {
            Ok(pending) => pending,
            Err(e) => {
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(e));
                    }
                    None => warn!(error = %e, "cannot start worker"),
                }
                return;
            }
        };

        let process_id = pending.process_id().clone();
        let outcomes = self.spawn_tx.clone();
        let task = tokio::spawn(async move {
            let _ = outcomes.send(pending.launch().await);
        });
        self.launches.insert(process_id, Launch { task, reply });
    }

    pub fn finish_spawn(&mut self, outcome: SpawnOutcome) {
        let reply = self
            .launches
            .remove(&outcome.process_id)
            .and_then(|launch| launch.reply);
        let result = self.processes.finish_spawn(outcome);

        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!(error = %e, "worker failed to start");
                }
            }
        }
    }

    pub fn kill_process(&mut self, process_id: &ProcessId) -> Result<(), ClusterError> {
        self.processes.kill_process(process_id)
    }

    // ── Lifecycle events ────────────────────────────────────────────

    /// Handle every lifecycle event that is already waiting.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Spawned { process_id } => {
                if let Err(e) = self.processes.add_to_queue(&process_id) {
                    warn!(process_id = %process_id, error = %e, "cannot mark new worker idle");
                }
                self.dispatch_queued();
            }
            ProcessEvent::Message { process_id, reply } => self.on_reply(process_id, reply),
            ProcessEvent::Exited {
                process_id, code, ..
            } => self.on_exit(process_id, code),
        }
    }

    fn on_reply(&mut self, process_id: ProcessId, reply: TaskReply) {
        let task_id = TaskId::from(reply.task_id);

        // A reply only counts for the task its sender is working on.
        let owned = self.assignments.get(&process_id) == Some(&task_id);
        let Some(completion) = owned.then(|| self.pending.remove(&task_id)).flatten() else {
            let orphan = ClusterError::OrphanedReply {
                process_id: process_id.to_string(),
                task_id: task_id.to_string(),
            };
            warn!(error = %orphan, "dropping reply");
            return;
        };

        self.assignments.remove(&process_id);
        self.discard_task(&task_id);

        let result = match reply.outcome {
            TaskOutcome::Success(value) => {
                self.counters.completed += 1;
                debug!(process_id = %process_id, task_id = %task_id, "task completed");
                Ok(value)
            }
            TaskOutcome::Failure(reason) => {
                self.counters.failed += 1;
                debug!(
                    process_id = %process_id,
                    task_id = %task_id,
                    reason = %reason,
                    "task failed"
                );
                Err(ClusterError::TaskFailed {
                    task_id: task_id.to_string(),
                    reason,
                })
            }
        };
        if completion.send(result).is_err() {
            debug!(task_id = %task_id, "task handle dropped before completion");
        }

        if self.processes.is_live(&process_id) {
            match self.tasks.get_next_task_id() {
                Some(next) => self.assign(process_id, next),
                None => {
                    if let Err(e) = self.processes.add_to_queue(&process_id) {
                        warn!(
                            process_id = %process_id,
                            error = %e,
                            "cannot return worker to idle queue"
                        );
                    }
                }
            }
        }
    }

    fn on_exit(&mut self, process_id: ProcessId, code: Option<i32>) {
        if let Some(task_id) = self.assignments.remove(&process_id) {
            let requeues = self.tasks.requeues(&task_id).unwrap_or(0);
            if self.max_requeues.is_some_and(|limit| requeues >= limit) {
                self.give_up(&process_id, &task_id, requeues + 1);
                self.dispatch_queued();
                return;
            }
            match self.tasks.requeue_task(&task_id) {
                Ok(()) => {
                    self.counters.requeued += 1;
                    info!(
                        process_id = %process_id,
                        task_id = %task_id,
                        code = ?code,
                        "worker exited mid-task, task requeued"
                    );
                }
                Err(e) => {
                    warn!(
                        process_id = %process_id,
                        task_id = %task_id,
                        error = %e,
                        "cannot requeue task of exited worker"
                    );
                    self.discard_task(&task_id);
                    if let Some(completion) = self.pending.remove(&task_id) {
                        let _ = completion.send(Err(e));
                    }
                }
            }
        }
        self.dispatch_queued();
    }

    /// Fail a task whose workers keep exiting under it.
    fn give_up(&mut self, process_id: &ProcessId, task_id: &TaskId, exits: u32) {
        warn!(
            process_id = %process_id,
            task_id = %task_id,
            exits,
            "worker exited mid-task again, giving up on task"
        );
        self.counters.failed += 1;
        self.discard_task(task_id);
        if let Some(completion) = self.pending.remove(task_id) {
            let _ = completion.send(Err(ClusterError::TaskFailed {
                task_id: task_id.to_string(),
                reason: format!("worker exited during the task {exits} times"),
            }));
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Pair queued tasks with idle workers until one side runs out.
    fn dispatch_queued(&mut self) {
        while self.tasks.queued_len() > 0 {
            let Some(process_id) = self.processes.get_next_process_id() else {
                return;
            };
            match self.tasks.get_next_task_id() {
                Some(task_id) => self.assign(process_id, task_id),
                None => {
                    if let Err(e) = self.processes.add_to_queue(&process_id) {
                        warn!(
                            process_id = %process_id,
                            error = %e,
                            "cannot return worker to idle queue"
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Make `process_id` busy with `task_id` and deliver the task.
    ///
    /// A failed delivery is left to the worker's exit, which requeues the task.
    fn assign(&mut self, process_id: ProcessId, task_id: TaskId) {
        if let Err(e) = self.processes.mark_busy(&process_id) {
            warn!(
                process_id = %process_id,
                task_id = %task_id,
                error = %e,
                "worker vanished before dispatch"
            );
            if let Err(e) = self.tasks.requeue_task(&task_id) {
                error!(task_id = %task_id, error = %e, "task lost during dispatch");
            }
            return;
        }
        self.assignments.insert(process_id.clone(), task_id.clone());

        let delivery = self.payload(&task_id).and_then(|(label, args)| {
            self.processes
                .send_to_process(&process_id, &task_id, &label, args)
        });
        if let Err(e) = delivery {
            warn!(process_id = %process_id, task_id = %task_id, error = %e, "task delivery failed");
        }
    }

    fn payload(&self, task_id: &TaskId) -> Result<(String, Vec<Value>), ClusterError> {
        Ok((self.tasks.label(task_id)?.to_owned(), self.tasks.args(task_id)?))
    }

    fn discard_task(&mut self, task_id: &TaskId) {
        if let Err(e) = self.tasks.delete_task(task_id) {
            warn!(task_id = %task_id, error = %e, "task already gone");
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Reject pending work with `Shutdown`, kill every worker and drop in-flight launches.
    pub fn shutdown(&mut self) {
        for process_id in self.processes.process_ids() {
            if let Err(e) = self.processes.kill_process(&process_id) {
                debug!(process_id = %process_id, error = %e, "kill during shutdown failed");
            }
        }
        self.release();
    }

    /// Stop without killing: workers see their input close and exit on their own.
    pub fn release(&mut self) {
        let rejected = self.pending.len();
        for (_, completion) in self.pending.drain() {
            let _ = completion.send(Err(ClusterError::Shutdown));
        }
        for (_, launch) in self.launches.drain() {
            launch.task.abort();
            if let Some(reply) = launch.reply {
                let _ = reply.send(Err(ClusterError::Shutdown));
            }
        }
        self.assignments.clear();
        self.processes.shutdown();
        info!(rejected, "cluster stopped");
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn stats(&self) -> ClusterStats {
        let spawning = self.processes.count_in(ProcessState::Spawning);
        ClusterStats {
            live_processes: self.processes.len() - spawning,
            spawning_processes: spawning,
            idle_processes: self.processes.count_in(ProcessState::Idle),
            busy_processes: self.processes.count_in(ProcessState::Busy),
            max_processes: self.processes.max_processes(),
            queued_tasks: self.tasks.queued_len(),
            pending_tasks: self.pending.len(),
            completed_tasks: self.counters.completed,
            failed_tasks: self.counters.failed,
            requeued_tasks: self.counters.requeued,
            task_pool: self.tasks.pool_stats(),
            started_at: self.started_at,
        }
    }

    /// Registered workers in id order, spawning ones included.
    pub fn process_infos(&self) -> Vec<ProcessInfo> {
        self.processes
            .process_ids()
            .into_iter()
            .filter_map(|process_id| {
                Some(ProcessInfo {
                    state: self.processes.state(&process_id)?,
                    pid: self.processes.pid(&process_id),
                    started_at: self.processes.started_at(&process_id)?,
                    task_id: self.assignments.get(&process_id).cloned(),
                    process_id,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub fn assignment(&self, process_id: &ProcessId) -> Option<&TaskId> {
        self.assignments.get(process_id)
    }

    #[cfg(test)]
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    #[cfg(test)]
    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }
}
