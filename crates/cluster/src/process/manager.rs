//! Registry and idle queue of worker processes.
//!
//! ```text
//! begin_spawn ─► Spawning ─► finish_spawn ─► Ready ─► add_to_queue ─► Idle
//!                                              ▲                       │
//!                                              │                get_next_process_id
//!                                           (reply)                    ▼
//!                                             Busy ◄──── mark_busy ─ Ready
//!
//! any state ── WorkerSignal::Exited ──► removed, ProcessEvent::Exited
//! ```
//!
//! Worker I/O tasks report on an internal signal channel; [`ProcessManager::pump`]
//! applies each signal to the registry and forwards the resulting
//! [`ProcessEvent`] to the single subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use smart_cluster_protocol::TaskRequest;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::id::{IdGenerator, ProcessId, TaskId};
use crate::queue::IndexedQueue;

use super::event::{ProcessEvent, ProcessState, WorkerSignal};
use super::launcher::{WorkerHandle, WorkerLauncher};

struct ProcessSlot {
    state: ProcessState,
    handle: Option<Box<dyn WorkerHandle>>,
    /// Kill requested before the worker finished starting.
    kill_on_ready: bool,
    started_at: DateTime<Utc>,
}

/// A launch in flight. Run [`PendingSpawn::launch`] anywhere, then hand the
/// result to [`ProcessManager::finish_spawn`].
pub struct PendingSpawn {
    process_id: ProcessId,
    launcher: Arc<dyn WorkerLauncher>,
    signals: UnboundedSender<WorkerSignal>,
}

/// Result of a [`PendingSpawn`].
pub struct SpawnOutcome {
    pub process_id: ProcessId,
    pub result: Result<Box<dyn WorkerHandle>, ClusterError>,
}

impl PendingSpawn {
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub async fn launch(self) -> SpawnOutcome {
        let result = self
            .launcher
            .launch(self.process_id.clone(), self.signals)
            .await;
        SpawnOutcome {
            process_id: self.process_id,
            result,
        }
    }
}

pub struct ProcessManager {
    launcher: Arc<dyn WorkerLauncher>,
    ids: IdGenerator,
    registry: HashMap<ProcessId, ProcessSlot>,
    idle: IndexedQueue<ProcessId>,
    max_processes: usize,
    signals_tx: UnboundedSender<WorkerSignal>,
    signals_rx: UnboundedReceiver<WorkerSignal>,
    subscriber: Option<UnboundedSender<ProcessEvent>>,
}

impl ProcessManager {
    /// `expected` sizes the preallocated idle-queue nodes; `max_processes`
    /// caps live plus spawning workers.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        expected: usize,
        max_processes: usize,
    ) -> Result<Self, ClusterError> {
        if max_processes == 0 {
            return Err(ClusterError::InvalidConfiguration(
                "max_processes must be at least 1".into(),
            ));
        }
        let idle = IndexedQueue::with_bounds(expected.min(max_processes), max_processes)?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        Ok(Self {
            launcher,
            ids: IdGenerator::default(),
            registry: HashMap::new(),
            idle,
            max_processes,
            signals_tx,
            signals_rx,
            subscriber: None,
        })
    }

    /// Register the lifecycle subscriber, replacing any previous one.
    pub fn subscribe(&mut self) -> UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.subscriber.replace(tx).is_some() {
            debug!("process event subscriber replaced");
        }
        rx
    }

    // ── Spawning ────────────────────────────────────────────────────

    /// Reserve an identifier and register it as spawning.
    pub fn begin_spawn(&mut self) -> Result<PendingSpawn, ClusterError> {
        if self.registry.len() >= self.max_processes {
            return Err(ClusterError::CapacityExceeded {
                max: self.max_processes,
            });
        }

        let process_id = ProcessId::from(self.ids.next_unique(|c| self.registry.contains_key(c)));
        self.registry.insert(
            process_id.clone(),
            ProcessSlot {
                state: ProcessState::Spawning,
                handle: None,
                kill_on_ready: false,
                started_at: Utc::now(),
            },
        );
        debug!(process_id = %process_id, "spawning worker");

        Ok(PendingSpawn {
            process_id,
            launcher: Arc::clone(&self.launcher),
            signals: self.signals_tx.clone(),
        })
    }

    /// Install a launched worker and emit `Spawned`, or drop the reservation.
    pub fn finish_spawn(&mut self, outcome: SpawnOutcome) -> Result<ProcessId, ClusterError> {
        let SpawnOutcome { process_id, result } = outcome;

        let mut handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove(&process_id);
                warn!(process_id = %process_id, error = %e, "worker failed to start");
                return Err(e);
            }
        };

        let Some(slot) = self.registry.get_mut(&process_id) else {
            // Reservation vanished; release the worker rather than track it.
            warn!(process_id = %process_id, "spawned worker has no reservation, releasing it");
            return Err(ClusterError::UnknownProcess(process_id.to_string()));
        };

        if slot.kill_on_ready {
            // Stays Spawning so it can never be queued; the exit purges it.
            if let Err(e) = handle.kill() {
                warn!(process_id = %process_id, error = %e, "failed to kill worker after startup");
            }
            slot.handle = Some(handle);
            info!(process_id = %process_id, "worker killed on startup");
            return Ok(process_id);
        }
        slot.state = ProcessState::Ready;
        slot.handle = Some(handle);
        slot.started_at = Utc::now();

        info!(process_id = %process_id, "worker spawned");
        self.emit(ProcessEvent::Spawned {
            process_id: process_id.clone(),
        });
        Ok(process_id)
    }

    /// Start a worker and wait until it is ready.
    pub async fn create_process(&mut self) -> Result<ProcessId, ClusterError> {
        let pending = self.begin_spawn()?;
        let outcome = pending.launch().await;
        self.finish_spawn(outcome)
    }

    // ── Idle queue ──────────────────────────────────────────────────

    /// Mark a started worker idle and append it to the idle queue.
    pub fn add_to_queue(&mut self, process_id: &ProcessId) -> Result<(), ClusterError> {
        let slot = self
            .registry
            .get_mut(process_id)
            .filter(|slot| slot.state != ProcessState::Spawning)
            .ok_or_else(|| ClusterError::UnknownProcess(process_id.to_string()))?;

        self.idle.add(process_id.clone())?;
        slot.state = ProcessState::Idle;
        Ok(())
    }

    /// Take the longest-idle worker. The caller decides what it becomes next.
    pub fn get_next_process_id(&mut self) -> Option<ProcessId> {
        let process_id = self.idle.shift()?;
        if let Some(slot) = self.registry.get_mut(&process_id) {
            slot.state = ProcessState::Ready;
        }
        Some(process_id)
    }

    pub fn mark_busy(&mut self, process_id: &ProcessId) -> Result<(), ClusterError> {
        if self.idle.contains(process_id) {
            self.idle.remove(process_id)?;
        }
        let slot = self
            .registry
            .get_mut(process_id)
            .filter(|slot| slot.handle.is_some())
            .ok_or_else(|| ClusterError::UnknownProcess(process_id.to_string()))?;
        slot.state = ProcessState::Busy;
        Ok(())
    }

    // ── Worker control ──────────────────────────────────────────────

    /// Deliver a task to a worker without waiting for it.
    pub fn send_to_process(
        &mut self,
        process_id: &ProcessId,
        task_id: &TaskId,
        label: &str,
        args: Vec<Value>,
    ) -> Result<(), ClusterError> {
        let handle = self
            .registry
            .get_mut(process_id)
            .and_then(|slot| slot.handle.as_mut())
            .ok_or_else(|| ClusterError::UnknownProcess(process_id.to_string()))?;

        debug!(process_id = %process_id, task_id = %task_id, label, "dispatching task");
        handle.send(TaskRequest::new(task_id.as_str(), label, args))
    }

    /// Terminate a worker. The exit arrives later as `ProcessEvent::Exited`.
    pub fn kill_process(&mut self, process_id: &ProcessId) -> Result<(), ClusterError> {
        let slot = self
            .registry
            .get_mut(process_id)
            .ok_or_else(|| ClusterError::UnknownProcess(process_id.to_string()))?;

        info!(process_id = %process_id, "kill requested");
        match slot.handle.as_mut() {
            Some(handle) => handle.kill(),
            None => {
                slot.kill_on_ready = true;
                Ok(())
            }
        }
    }

    /// Ask every started worker to exit and forget about all of them.
    ///
    /// No `Exited` events are emitted for workers released this way.
    pub fn shutdown(&mut self) {
        for (process_id, mut slot) in self.registry.drain() {
            if let Some(handle) = slot.handle.as_mut() {
                if let Err(e) = handle.request_shutdown() {
                    debug!(process_id = %process_id, error = %e, "worker already gone");
                }
            }
        }
        while self.idle.shift().is_some() {}
        self.subscriber = None;
    }

    // ── Signals ─────────────────────────────────────────────────────

    /// Wait for the next worker signal and apply it.
    ///
    /// Cancel-safe: the only suspension point is the channel receive.
    pub async fn pump(&mut self) {
        if let Some(signal) = self.signals_rx.recv().await {
            self.apply(signal);
        }
    }

    /// Apply any signals that are already waiting, without suspending.
    pub fn pump_ready(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(signal) = self.signals_rx.try_recv() {
            self.apply(signal);
            applied += 1;
        }
        applied
    }

    fn apply(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Message { process_id, reply } => {
                if !self.registry.contains_key(&process_id) {
                    debug!(
                        process_id = %process_id,
                        task_id = %reply.task_id,
                        "reply from untracked worker dropped"
                    );
                    return;
                }
                self.emit(ProcessEvent::Message { process_id, reply });
            }
            WorkerSignal::Exited {
                process_id,
                code,
                signal,
            } => {
                if self.registry.remove(&process_id).is_none() {
                    debug!(process_id = %process_id, "exit of untracked worker ignored");
                    return;
                }
                if self.idle.contains(&process_id) {
                    if let Err(e) = self.idle.remove(&process_id) {
                        warn!(process_id = %process_id, error = %e, "idle queue out of sync");
                    }
                }
                info!(process_id = %process_id, code = ?code, signal = ?signal, "worker exited");
                self.emit(ProcessEvent::Exited {
                    process_id,
                    code,
                    signal,
                });
            }
        }
    }

    fn emit(&mut self, event: ProcessEvent) {
        let Some(subscriber) = &self.subscriber else {
            debug!(
                kind = ?event.kind(),
                process_id = %event.process_id(),
                "no subscriber for process event"
            );
            return;
        };
        if subscriber.send(event).is_err() {
            debug!("process event subscriber dropped");
            self.subscriber = None;
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn state(&self, process_id: &ProcessId) -> Option<ProcessState> {
        self.registry.get(process_id).map(|slot| slot.state)
    }

    pub fn is_live(&self, process_id: &ProcessId) -> bool {
        self.registry.contains_key(process_id)
    }

    pub fn pid(&self, process_id: &ProcessId) -> Option<u32> {
        self.registry
            .get(process_id)
            .and_then(|slot| slot.handle.as_ref())
            .and_then(|handle| handle.pid())
    }

    pub fn started_at(&self, process_id: &ProcessId) -> Option<DateTime<Utc>> {
        self.registry.get(process_id).map(|slot| slot.started_at)
    }

    /// Registered workers, spawning ones included.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn count_in(&self, state: ProcessState) -> usize {
        self.registry.values().filter(|slot| slot.state == state).count()
    }

    /// Idle workers, longest-idle first.
    pub fn idle_ids(&self) -> Vec<ProcessId> {
        self.idle.iter().cloned().collect()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.registry.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }
}
