//! echo-worker: reference worker for smart-cluster.
//!
//! Labels:
//! - `echo`: returns its first argument (or `null`)
//! - `sum`: adds numeric arguments
//! - `fail`: reports a task failure with the first argument as reason
//! - `sleep`: waits `args[0]` milliseconds, then returns them
//! - `crash`: exits the process with code 3 without replying
//!
//! Setting `ECHO_WORKER_FAIL_STARTUP` makes the worker refuse to start.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use smart_cluster::PROCESS_ID_ENV;
use smart_cluster_protocol::{TaskRequest, WorkerBuilder, WorkerRunner};

const FAIL_STARTUP_ENV: &str = "ECHO_WORKER_FAIL_STARTUP";

async fn handle(request: TaskRequest) -> Result<Value, String> {
    match request.label.as_str() {
        "echo" => Ok(request.args.into_iter().next().unwrap_or(Value::Null)),
        "sum" => {
            let mut total = 0.0;
            for arg in &request.args {
                total += arg
                    .as_f64()
                    .ok_or_else(|| format!("sum expects numbers, got {arg}"))?;
            }
            Ok(json!(total))
        }
        "fail" => Err(request
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string()),
        "sleep" => {
            let ms = request.args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        }
        "crash" => std::process::exit(3),
        other => Err(format!("unknown label '{other}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries frames, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let process_id = std::env::var(PROCESS_ID_ENV).unwrap_or_default();

    if let Ok(reason) = std::env::var(FAIL_STARTUP_ENV) {
        WorkerRunner::refuse(&mut tokio::io::stdout(), reason).await?;
        return Ok(());
    }

    let config = WorkerBuilder::new(format!("echo-worker-{process_id}"))
        .on_task(handle)
        .build();
    let handled = WorkerRunner::run_stdio(config).await?;

    info!(process_id = %process_id, handled, "echo-worker exiting");
    Ok(())
}
