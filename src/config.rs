//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks and metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace in which datacenters are watched.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The delay before the next pass of a datacenter which has work in flight.
    #[serde(default = "Config::default_requeue_seconds")]
    pub requeue_seconds: u64,
    /// The delay before the next pass of a converged datacenter.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The upper bound of the backoff applied after failed passes.
    #[serde(default = "Config::default_backoff_max_seconds")]
    pub backoff_max_seconds: u64,

    /// The timeout applied to each K8s API call.
    #[serde(default = "Config::default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,
    /// The timeout applied to each management API call.
    #[serde(default = "Config::default_mgmt_timeout_seconds")]
    pub mgmt_timeout_seconds: u64,
    /// The port of the management API of each server node.
    #[serde(default = "Config::default_mgmt_api_port")]
    pub mgmt_api_port: u16,

    /// The number of consecutive passes a node may stay unreachable while it is being started,
    /// after which it is flagged for replacement.
    #[serde(default = "Config::default_start_retry_budget")]
    pub start_retry_budget: u32,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn resync_delay(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub fn mgmt_timeout(&self) -> Duration {
        Duration::from_secs(self.mgmt_timeout_seconds)
    }

    fn default_http_port() -> u16 {
        8000
    }

    fn default_requeue_seconds() -> u64 {
        5
    }

    fn default_resync_seconds() -> u64 {
        300
    }

    fn default_backoff_max_seconds() -> u64 {
        120
    }

    fn default_api_timeout_seconds() -> u64 {
        10
    }

    fn default_mgmt_timeout_seconds() -> u64 {
        30
    }

    fn default_mgmt_api_port() -> u16 {
        8080
    }

    fn default_start_retry_budget() -> u32 {
        20
    }
}
