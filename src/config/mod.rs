use crate::pool::PoolConfig;
use crate::source::{SendPolicy, StreamOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// A downstream log collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Link name used in logs and usage tracking
    pub name: String,

    /// Collector address (host:port)
    pub host_port: String,

    /// Maximum pooled connections to this collector
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for one batch write plus reply, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Idle connections older than this are discarded, in seconds
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_max_connections() -> usize {
    20
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_idle_secs() -> u64 {
    90
}

impl CollectorConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_idle_time: Duration::from_secs(self.max_idle_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A business stream and the shard queues feeding it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,

    /// Shard key -> queue store URLs (one reader per URL)
    pub queues: BTreeMap<String, Vec<String>>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,

    #[serde(default = "default_workers_per_shard")]
    pub workers_per_shard: usize,
}

fn default_batch_size() -> usize {
    300
}

fn default_channel_depth() -> usize {
    10
}

fn default_workers_per_shard() -> usize {
    10
}

/// Send-with-retry settings, shared by all streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Log about one in N successful sends (0 = never)
    #[serde(default = "default_trace_sample_rate")]
    pub trace_sample_rate: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_trace_sample_rate() -> u32 {
    10_000
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            trace_sample_rate: default_trace_sample_rate(),
        }
    }
}

/// Start/stop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_empty_backoff_ms")]
    pub empty_backoff_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_empty_backoff_ms() -> u64 {
    100
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            empty_backoff_ms: default_empty_backoff_ms(),
        }
    }
}

/// Throughput reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitor log lines (0 = disabled)
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

fn default_monitor_interval() -> u64 {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Collector endpoints, in registration order
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.collectors.is_empty() {
            anyhow::bail!("No collectors configured");
        }
        if self.sender.max_attempts == 0 {
            anyhow::bail!("sender.max_attempts must be at least 1");
        }

        let mut names = std::collections::HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                anyhow::bail!("Duplicate stream name '{}'", stream.name);
            }
            if stream.queues.is_empty() || stream.queues.values().any(Vec::is_empty) {
                anyhow::bail!("Stream '{}' has a shard without queue URLs", stream.name);
            }
            if stream.batch_size == 0 {
                anyhow::bail!("Stream '{}': batch_size must be at least 1", stream.name);
            }
            if stream.channel_depth == 0 {
                anyhow::bail!("Stream '{}': channel_depth must be at least 1", stream.name);
            }
            if stream.workers_per_shard == 0 {
                anyhow::bail!("Stream '{}': workers_per_shard must be at least 1", stream.name);
            }
        }

        Ok(())
    }

    /// Runtime options for a configured stream
    pub fn stream_options(&self, stream: &StreamConfig) -> StreamOptions {
        StreamOptions {
            batch_size: stream.batch_size,
            channel_depth: stream.channel_depth,
            workers_per_shard: stream.workers_per_shard,
            empty_backoff: Duration::from_millis(self.lifecycle.empty_backoff_ms),
            grace_period: Duration::from_millis(self.lifecycle.grace_period_ms),
            send: SendPolicy {
                max_attempts: self.sender.max_attempts,
                acquire_timeout: Duration::from_millis(self.sender.acquire_timeout_ms),
                trace_sample_rate: self.sender.trace_sample_rate,
            },
        }
    }

    pub fn get_stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - LOGPOOL_COLLECTORS (comma-separated host:port list, required)
/// - LOGPOOL_REDIS_URL (optional, defaults to redis://127.0.0.1:6379)
/// - LOGPOOL_STREAMS (comma-separated `name=queue_key` pairs, required)
/// - LOGPOOL_BATCH_SIZE (optional)
/// - LOGPOOL_WORKERS (optional, per shard)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    let collectors = std::env::var("LOGPOOL_COLLECTORS")
        .context("LOGPOOL_COLLECTORS environment variable not set")?;

    config.collectors = collectors
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|host_port| CollectorConfig {
            name: host_port.to_string(),
            host_port: host_port.to_string(),
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_idle_secs: default_max_idle_secs(),
        })
        .collect();

    if config.collectors.is_empty() {
        anyhow::bail!("LOGPOOL_COLLECTORS contains no valid endpoints");
    }

    let redis_url = std::env::var("LOGPOOL_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let batch_size = match std::env::var("LOGPOOL_BATCH_SIZE") {
        Ok(v) => v.parse().context("LOGPOOL_BATCH_SIZE is not a number")?,
        Err(_) => default_batch_size(),
    };

    let workers_per_shard = match std::env::var("LOGPOOL_WORKERS") {
        Ok(v) => v.parse().context("LOGPOOL_WORKERS is not a number")?,
        Err(_) => default_workers_per_shard(),
    };

    let streams = std::env::var("LOGPOOL_STREAMS")
        .context("LOGPOOL_STREAMS environment variable not set")?;

    // Several pairs may share a stream name: each adds a shard
    let mut by_name: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for pair in streams.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, queue) = pair
            .split_once('=')
            .with_context(|| format!("Invalid LOGPOOL_STREAMS entry '{}', expected name=queue", pair))?;
        by_name
            .entry(name.trim().to_string())
            .or_default()
            .insert(queue.trim().to_string(), vec![redis_url.clone()]);
    }

    config.streams = by_name
        .into_iter()
        .map(|(name, queues)| StreamConfig {
            name,
            queues,
            batch_size,
            channel_depth: default_channel_depth(),
            workers_per_shard,
        })
        .collect();

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
