//! Worker process lifecycle: launching, idle tracking and event delivery.

mod event;
mod launcher;
mod manager;

pub use event::{ProcessEvent, ProcessEventKind, ProcessState, WorkerSignal};
pub use launcher::{CommandLauncher, WorkerHandle, WorkerLauncher, PROCESS_ID_ENV};
pub use manager::{PendingSpawn, ProcessManager, SpawnOutcome};
