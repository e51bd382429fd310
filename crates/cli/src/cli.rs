use clap::Parser;

/// Run newline-delimited JSON jobs on a pool of worker processes.
///
/// Each stdin line is `{"label": "...", "args": [...]}`. One result line is
/// printed per job, in input order.
#[derive(Parser, Debug)]
#[command(name = "smart-cluster", version, about)]
pub struct CliArgs {
    /// Path to the cluster config file. Defaults apply when it does not exist.
    #[arg(long, env = "SMART_CLUSTER_CONFIG", default_value = "config/smart-cluster.toml")]
    pub config: String,

    /// Number of workers to start (overrides the config file).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Worker program to run (overrides the config file).
    #[arg(long)]
    pub worker_program: Option<String>,

    /// Fail a job after its worker exits under it this many times plus one.
    /// Defaults to the config file's `max_requeues`, else 2.
    #[arg(long)]
    pub max_requeues: Option<u32>,
}
