//! Cluster configuration: TOML file, then environment overrides, then validation.

mod loading;
mod types;
mod validation;

pub use types::{ClusterConfig, ClusterSettings, WorkerConfig};
