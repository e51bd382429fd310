use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use smart_cluster::ClusterConfig;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;

/// Requeue limit when neither the flag nor the config file sets one.
const DEFAULT_MAX_REQUEUES: u32 = 2;

/// Load the cluster config and apply command-line overrides.
pub fn load(args: &CliArgs) -> Result<ClusterConfig> {
    let path = Path::new(&args.config);
    let mut config = if path.exists() {
        let config = ClusterConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        info!(path = %path.display(), "loaded cluster config");
        config
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        let mut config = ClusterConfig::default();
        config.apply_env_overrides();
        config
    };

    if let Some(workers) = args.workers {
        config.num_processes = workers;
        if config.max_processes.is_some_and(|max| max < workers) {
            config.max_processes = Some(workers);
        }
    }
    if let Some(program) = &args.worker_program {
        config.worker.program = program.clone();
    }
    config.worker.program = resolve_program(&config.worker.program);
    config.max_requeues = args
        .max_requeues
        .or(config.max_requeues)
        .or(Some(DEFAULT_MAX_REQUEUES));

    config.validate().context("invalid cluster configuration")?;
    Ok(config)
}

/// Prefer a bare program name installed next to this executable over `PATH`.
fn resolve_program(program: &str) -> String {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return program.to_string();
    }
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| sibling_path(dir, program)));
    match sibling {
        Some(path) if path.is_file() => {
            debug!(program, path = %path.display(), "using worker next to the cli");
            path.to_string_lossy().into_owned()
        }
        _ => program.to_string(),
    }
}

fn sibling_path(dir: &Path, program: &str) -> PathBuf {
    dir.join(format!("{program}{}", std::env::consts::EXE_SUFFIX))
}
