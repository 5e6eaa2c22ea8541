//! Runtime configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,

    /// The port of this node's admin surface, queried by peer nodes for
    /// bootstrap status and rebalance progress.
    pub admin_port: u16,
    /// The UUID of this node as known to the cluster manager.
    #[serde(default = "Config::default_node_uuid")]
    pub node_uuid: String,
    /// Seed membership for the cluster manager, formatted as a comma-separated
    /// list of `uuid@host:port` entries.
    #[serde(default)]
    pub cluster_members: String,

    /// The number of workers spawned per application by default.
    #[serde(default = "Config::default_worker_count")]
    pub worker_count: usize,
    /// The deadline timeout applied to handler execution, in seconds.
    #[serde(default = "Config::default_deadline_timeout")]
    pub deadline_timeout: u64,
    /// Where partition streams begin for newly deployed applications.
    #[serde(default)]
    pub stream_boundary: StreamBoundary,
}

/// The policy controlling where a partition's stream begins.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamBoundary {
    /// Start from the beginning of the partition's stream and listen forever.
    Everything,
    /// Start from the partition's current sequence number and listen forever.
    FromNow,
}

impl Default for StreamBoundary {
    fn default() -> Self {
        StreamBoundary::Everything
    }
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    fn default_node_uuid() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn default_worker_count() -> usize {
        3
    }

    fn default_deadline_timeout() -> u64 {
        5
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for testing.
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: String::new(),
            admin_port: 0,
            node_uuid: "node-0".into(),
            cluster_members: String::new(),
            worker_count: 3,
            deadline_timeout: 5,
            stream_boundary: StreamBoundary::Everything,
        })
    }
}
