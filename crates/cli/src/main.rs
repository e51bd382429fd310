mod cli;
mod config;
mod jobs;
mod supervisor;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use smart_cluster::{ClusterError, SmartCluster, TaskHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::jobs::{error_line, ok_line, parse_job};
use crate::supervisor::{supervise, PoolPolicy};

/// Wait between submissions while the task queue is full.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(10);

enum Submitted {
    Running(usize, TaskHandle),
    Rejected(usize, String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = config::load(&args)?;
    let policy = PoolPolicy::new(config.num_processes);
    let cluster = SmartCluster::start(config).context("failed to start cluster")?;
    let supervisor = tokio::spawn(supervise(cluster.clone(), policy));

    // Results are printed by a separate task so that submission never waits on them.
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_results(results_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let submitted = match parse_job(&line) {
            Ok(job) => match submit(&cluster, job.label, job.args).await {
                Ok(handle) => Submitted::Running(line_no, handle),
                Err(e) => Submitted::Rejected(line_no, e.to_string()),
            },
            Err(e) => Submitted::Rejected(line_no, e),
        };
        if results_tx.send(submitted).is_err() {
            break;
        }
    }
    drop(results_tx);

    let printed = printer.await.context("result printer failed")??;
    info!(jobs = printed, "all jobs finished");

    supervisor.abort();
    match cluster.stats().await {
        Ok(stats) => eprintln!("{}", serde_json::to_string_pretty(&stats)?),
        Err(e) => warn!(error = %e, "no final stats"),
    }
    cluster.shutdown().await?;
    Ok(())
}

/// Submit, retrying while the task queue is full.
async fn submit(
    cluster: &SmartCluster,
    label: String,
    args: Vec<serde_json::Value>,
) -> Result<TaskHandle, ClusterError> {
    loop {
        match cluster.submit_task(label.clone(), args.clone()).await {
            Err(e) if e.is_capacity() => {
                debug!("task queue full, waiting");
                tokio::time::sleep(BACKPRESSURE_DELAY).await;
            }
            other => return other,
        }
    }
}

async fn print_results(mut results: mpsc::UnboundedReceiver<Submitted>) -> Result<usize> {
    let mut stdout = tokio::io::stdout();
    let mut printed = 0;
    while let Some(submitted) = results.recv().await {
        let output = match submitted {
            Submitted::Running(line, handle) => match handle.await {
                Ok(value) => ok_line(line, value),
                Err(e) => error_line(line, &e.to_string()),
            },
            Submitted::Rejected(line, error) => error_line(line, &error),
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        printed += 1;
    }
    stdout.flush().await?;
    Ok(printed)
}
