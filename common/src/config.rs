// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeConfig,
    pub redis: RedisConfig,
    pub leader: LeaderConfig,
    pub completion: CompletionConfig,
    pub engine: EngineConfig,
    pub observability: ObservabilityConfig,
    pub jobs: Vec<JobConfig>,
}

/// Which coordination service backs leadership and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identity; generated when not configured
    pub id: Option<String>,
    pub backend: CoordinationBackend,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            backend: CoordinationBackend::Redis,
        }
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every key written by this cluster
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "batch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Default leadership acquisition timeout, overridable per job
    pub acquire_timeout_ms: u64,
    /// Lease lifetime in the coordination service
    pub lease_ttl_ms: u64,
    /// How often a held lease is renewed while the job runs
    pub renew_interval_ms: u64,
    /// Pause between acquisition attempts
    pub retry_interval_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 60_000,
            lease_ttl_ms: 30_000,
            renew_interval_ms: 10_000,
            retry_interval_ms: 250,
        }
    }
}

impl LeaderConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on the completion wait; `None` waits forever
    pub wait_timeout_ms: Option<u64>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            wait_timeout_ms: Some(3_600_000),
        }
    }
}

impl CompletionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    /// Worker capacity of the node-local engine
    pub max_concurrent_jobs: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_concurrent_jobs: 10,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tracing_endpoint: None,
        }
    }
}

/// A job hosted by this node. Exactly one of `cron` and `follow_job` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub name: String,
    /// Seconds-precision cron expression
    pub cron: Option<String>,
    /// IANA timezone for `cron`, defaults to UTC
    pub timezone: Option<String>,
    /// Shard hint; the job name is used when absent
    pub shard: Option<String>,
    /// Predecessor job for chained execution
    pub follow_job: Option<String>,
    pub start_delay_ms: u64,
    /// Overrides `leader.acquire_timeout_ms`
    pub acquire_timeout_ms: Option<u64>,
    /// External command run as the job body
    pub command: Vec<String>,
    pub parameters: HashMap<String, String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.node.backend == CoordinationBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.leader.lease_ttl_ms == 0 {
            return Err("Leader lease_ttl_ms must be greater than 0".to_string());
        }
        if self.leader.renew_interval_ms == 0
            || self.leader.renew_interval_ms >= self.leader.lease_ttl_ms
        {
            return Err("Leader renew_interval_ms must be between 0 and lease_ttl_ms".to_string());
        }
        if self.leader.retry_interval_ms == 0 {
            return Err("Leader retry_interval_ms must be greater than 0".to_string());
        }

        if self.completion.poll_interval_ms == 0 {
            return Err("Completion poll_interval_ms must be greater than 0".to_string());
        }

        if self.engine.tick_interval_ms == 0 {
            return Err("Engine tick_interval_ms must be greater than 0".to_string());
        }
        if self.engine.max_concurrent_jobs == 0 {
            return Err("Engine max_concurrent_jobs must be greater than 0".to_string());
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err("Job name cannot be empty".to_string());
            }
            if !names.insert(job.name.as_str()) {
                return Err(format!("Job '{}' is defined more than once", job.name));
            }
        }

        Ok(())
    }
}
