//! The orchestrator: task submission bound to worker availability.
//!
//! ```text
//!  SmartCluster ──Command──►  event loop (owns ClusterCore)
//!   (clone-able)                │   ▲
//!                               │   └── ProcessEvent ◄── ProcessManager::pump
//!   TaskHandle ◄──oneshot───────┘
//! ```

mod engine;
mod handle;
mod stats;

pub use handle::{SmartCluster, TaskHandle};
pub use stats::{ClusterStats, ProcessInfo};

#[cfg(test)]
mod tests;
