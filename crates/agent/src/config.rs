//! Agent configuration

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use couchbase_input::collector::{DESCRIPTION, SAMPLE_CONFIG};
use couchbase_input::{ClientConfig, CouchbaseConfig, GatherConfig, OutputFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
const ENV_PREFIX: &str = "COUCHBASE_AGENT";

/// Config file looked up in the working directory when none is given
const DEFAULT_CONFIG_NAME: &str = "couchbase-agent";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Cluster addresses, `[protocol://][user:password@]address[:port]`
    #[serde(default)]
    pub servers: Vec<String>,

    /// Detailed per-bucket-per-node stats to collect, `"*"` for all
    #[serde(default)]
    pub bucket_node_stats: Vec<String>,

    /// Gather interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Maximum jitter added to each interval, in milliseconds
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Metrics channel capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Timeout for REST requests; unset means no timeout
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Output format for metrics written to stdout
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_interval() -> u64 {
    10
}

fn default_jitter() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    1000
}

impl AgentConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        let config = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?;

        config.try_deserialize().context("Invalid configuration")
    }

    /// Settings for the Couchbase input
    pub fn input_config(&self) -> CouchbaseConfig {
        CouchbaseConfig {
            servers: self.servers.clone(),
            bucket_node_stats: self.bucket_node_stats.clone(),
            client: ClientConfig {
                request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            },
        }
    }

    /// Settings for the gather loop
    pub fn gather_config(&self) -> GatherConfig {
        GatherConfig {
            interval: Duration::from_secs(self.interval_secs),
            jitter: Duration::from_millis(self.jitter_ms),
            buffer_size: self.buffer_size,
        }
    }
}

/// Example configuration file, loadable as printed
pub fn sample_config() -> String {
    format!("# {}\n{}", DESCRIPTION, SAMPLE_CONFIG.trim_start_matches('\n'))
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("servers")
        .with_list_parse_key("bucket_node_stats")
}
