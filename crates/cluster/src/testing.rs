//! In-process worker launcher for exercising the scheduler without child processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use smart_cluster_protocol::{TaskOutcome, TaskReply, TaskRequest};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;

use crate::error::ClusterError;
use crate::id::ProcessId;
use crate::process::{WorkerHandle, WorkerLauncher, WorkerSignal};

#[derive(Default)]
struct MockState {
    workers: HashMap<ProcessId, MockWorker>,
    /// Launch order of workers that started successfully.
    launched: Vec<ProcessId>,
    failures: VecDeque<String>,
    dispatched: Vec<(ProcessId, TaskRequest)>,
    killed: HashSet<ProcessId>,
}

struct MockWorker {
    signals: UnboundedSender<WorkerSignal>,
    sent: Vec<TaskRequest>,
    exited: bool,
}

/// A launcher whose workers are plain records driven by the test.
///
/// Workers never answer on their own: call [`reply`](Self::reply) and
/// [`exit`](Self::exit) to produce the signals a real worker would.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockLauncher {
    /// Workers start as soon as they are launched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers stay spawning until [`release_spawns`](Self::release_spawns) lets them through.
    pub fn gated() -> Self {
        Self {
            state: Arc::default(),
            gate: Some(Arc::new(Semaphore::new(0))),
        }
    }

    pub fn release_spawns(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Make the next launch fail with `reason`.
    pub fn fail_next_spawn(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().failures.push_back(reason.into());
    }

    pub fn launched(&self) -> Vec<ProcessId> {
        self.state.lock().unwrap().launched.clone()
    }

    /// Every task delivered so far, in delivery order.
    pub fn dispatched(&self) -> Vec<(ProcessId, TaskRequest)> {
        self.state.lock().unwrap().dispatched.clone()
    }

    /// Tasks delivered to one worker.
    pub fn sent(&self, process_id: &ProcessId) -> Vec<TaskRequest> {
        self.state
            .lock()
            .unwrap()
            .workers
            .get(process_id)
            .map(|w| w.sent.clone())
            .unwrap_or_default()
    }

    pub fn was_killed(&self, process_id: &ProcessId) -> bool {
        self.state.lock().unwrap().killed.contains(process_id)
    }

    /// Have a worker answer a task.
    pub fn reply(&self, process_id: &ProcessId, task_id: &str, outcome: TaskOutcome) {
        let state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get(process_id)
            .unwrap_or_else(|| panic!("no mock worker {process_id}"));
        let _ = worker.signals.send(WorkerSignal::Message {
            process_id: process_id.clone(),
            reply: TaskReply {
                task_id: task_id.to_string(),
                outcome,
            },
        });
    }

    /// Have a worker exit with `code`.
    pub fn exit(&self, process_id: &ProcessId, code: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        Self::terminate(&mut state, process_id, code, None);
    }

    /// Poll until at least `n` tasks were delivered.
    pub async fn wait_for_dispatches(&self, n: usize) -> Vec<(ProcessId, TaskRequest)> {
        self.wait_until(|state| state.dispatched.len() >= n).await;
        self.dispatched()
    }

    /// Poll until at least `n` workers started.
    pub async fn wait_for_workers(&self, n: usize) -> Vec<ProcessId> {
        self.wait_until(|state| state.launched.len() >= n).await;
        self.launched()
    }

    async fn wait_until(&self, done: impl Fn(&MockState) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let reached = done(&self.state.lock().unwrap());
            if reached {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mock launcher condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn terminate(
        state: &mut MockState,
        process_id: &ProcessId,
        code: Option<i32>,
        signal: Option<i32>,
    ) {
        let Some(worker) = state.workers.get_mut(process_id) else {
            return;
        };
        if worker.exited {
            return;
        }
        worker.exited = true;
        let _ = worker.signals.send(WorkerSignal::Exited {
            process_id: process_id.clone(),
            code,
            signal,
        });
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(
        &self,
        process_id: ProcessId,
        signals: UnboundedSender<WorkerSignal>,
    ) -> Result<Box<dyn WorkerHandle>, ClusterError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ClusterError::Shutdown)?
                .forget();
        }

        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.failures.pop_front() {
            return Err(ClusterError::SpawnError {
                process_id: process_id.to_string(),
                reason,
            });
        }

        state.workers.insert(
            process_id.clone(),
            MockWorker {
                signals,
                sent: Vec::new(),
                exited: false,
            },
        );
        state.launched.push(process_id.clone());

        Ok(Box::new(MockHandle {
            process_id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHandle {
    process_id: ProcessId,
    state: Arc<Mutex<MockState>>,
}

impl WorkerHandle for MockHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&mut self, request: TaskRequest) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&self.process_id)
            .filter(|w| !w.exited)
            .ok_or_else(|| ClusterError::WorkerUnavailable(self.process_id.to_string()))?;
        worker.sent.push(request.clone());
        state.dispatched.push((self.process_id.clone(), request));
        Ok(())
    }

    fn request_shutdown(&mut self) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        MockLauncher::terminate(&mut state, &self.process_id, Some(0), None);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.killed.insert(self.process_id.clone());
        MockLauncher::terminate(&mut state, &self.process_id, None, Some(9));
        Ok(())
    }
}
