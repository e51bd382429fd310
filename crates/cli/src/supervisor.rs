//! Keeps the worker pool at its configured size.
//!
//! The cluster never replaces workers on its own. This task tops the pool back
//! up after exits, and stops the cluster when the pool is empty and cannot be
//! refilled, so that every outstanding job resolves instead of waiting forever.

use std::time::Duration;

use smart_cluster::{ClusterError, SmartCluster};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    /// Workers to keep alive.
    pub target: usize,
    /// Pause between pool checks.
    pub interval: Duration,
    /// Consecutive failed respawns tolerated while no worker is left.
    pub max_spawn_failures: u32,
}

impl PoolPolicy {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            interval: Duration::from_millis(100),
            max_spawn_failures: 3,
        }
    }
}

/// Run until the cluster stops.
pub async fn supervise(cluster: SmartCluster, policy: PoolPolicy) {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(policy.interval).await;

        let Ok(stats) = cluster.stats().await else {
            debug!("cluster stopped, supervisor exiting");
            return;
        };
        let running = stats.live_processes + stats.spawning_processes;
        if running >= policy.target {
            failures = 0;
            continue;
        }

        match cluster.spawn_process().await {
            Ok(process_id) => {
                failures = 0;
                info!(
                    process_id = %process_id,
                    running = running + 1,
                    "replacement worker started"
                );
            }
            Err(ClusterError::Shutdown) => return,
            Err(e) if e.is_capacity() => debug!(error = %e, "pool at its cap"),
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "replacement worker failed to start");
                if running == 0 && failures >= policy.max_spawn_failures {
                    error!(
                        failures,
                        "no workers left and none can be started, stopping cluster"
                    );
                    if let Err(e) = cluster.shutdown().await {
                        warn!(error = %e, "cluster shutdown failed");
                    }
                    return;
                }
            }
        }
    }
}
