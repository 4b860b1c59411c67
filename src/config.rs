use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MatchingConfig {
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Settings for cross-partition forwarding
#[derive(Debug, Deserialize, Clone)]
pub struct ForwarderConfig {
    /// Maximum number of concurrently outstanding forwarded polls (default: 1)
    #[serde(default = "default_max_outstanding_polls")]
    pub max_outstanding_polls: usize,
    /// Maximum number of concurrently outstanding forwarded adds (default: 1)
    #[serde(default = "default_max_outstanding_adds")]
    pub max_outstanding_adds: usize,
    /// Token-bucket rate on forwarded adds and queries, per second.
    /// 0 disables rate limiting entirely. (default: 10)
    #[serde(default = "default_max_rate_per_second")]
    pub max_rate_per_second: u32,
    /// Fan-out of the partition tree (default: 20)
    #[serde(default = "default_max_children_per_node")]
    pub max_children_per_node: u32,
}

fn default_max_outstanding_polls() -> usize {
    1
}

fn default_max_outstanding_adds() -> usize {
    1
}

fn default_max_rate_per_second() -> u32 {
    10
}

fn default_max_children_per_node() -> u32 {
    20
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_outstanding_polls: default_max_outstanding_polls(),
            max_outstanding_adds: default_max_outstanding_adds(),
            max_rate_per_second: default_max_rate_per_second(),
            max_children_per_node: default_max_children_per_node(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatcherConfig {
    /// How long a producer offer waits for a poller before the task is
    /// persisted to the backlog instead (default: 1000ms)
    #[serde(default = "default_sync_match_timeout_ms")]
    pub sync_match_timeout_ms: u64,
    /// Cap on a single poll wait, regardless of the caller's deadline
    /// (default: 60s)
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,
}

fn default_sync_match_timeout_ms() -> u64 {
    1_000
}

fn default_long_poll_timeout_ms() -> u64 {
    60_000
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            sync_match_timeout_ms: default_sync_match_timeout_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
        }
    }
}

impl MatcherConfig {
    pub fn sync_match_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_match_timeout_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BacklogConfig {
    /// Maximum number of tasks fetched per storage read (default: 1000)
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    /// Interval between conditional writes of the ack level (default: 60s)
    #[serde(default = "default_update_ack_interval_ms")]
    pub update_ack_interval_ms: u64,
    /// Maximum completed rows deleted per trim call (default: 100)
    #[serde(default = "default_max_delete_batch_size")]
    pub max_delete_batch_size: usize,
}

fn default_read_batch_size() -> usize {
    1_000
}

fn default_update_ack_interval_ms() -> u64 {
    60_000
}

fn default_max_delete_batch_size() -> usize {
    100
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            read_batch_size: default_read_batch_size(),
            update_ack_interval_ms: default_update_ack_interval_ms(),
            max_delete_batch_size: default_max_delete_batch_size(),
        }
    }
}

impl BacklogConfig {
    pub fn update_ack_interval(&self) -> Duration {
        Duration::from_millis(self.update_ack_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseConfig {
    /// Number of task ids in one leased block. A crashed writer abandons at
    /// most this many ids. (default: 100000)
    #[serde(default = "default_range_size")]
    pub range_size: i64,
}

fn default_range_size() -> i64 {
    100_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// A queue manager with no traffic for this long stops itself, leaving
    /// durable state intact (default: 5m)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// A sticky queue whose worker has not polled within this window rejects
    /// offers with sticky-worker-unavailable (default: 10s)
    #[serde(default = "default_sticky_poller_timeout_ms")]
    pub sticky_poller_timeout_ms: u64,
    /// Expiry stamped on sticky task writes (default: 24h)
    #[serde(default = "default_sticky_task_ttl_ms")]
    pub sticky_task_ttl_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_sticky_poller_timeout_ms() -> u64 {
    10_000
}

fn default_sticky_task_ttl_ms() -> u64 {
    86_400_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            sticky_poller_timeout_ms: default_sticky_poller_timeout_ms(),
            sticky_task_ttl_ms: default_sticky_task_ttl_ms(),
        }
    }
}

impl QueueConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Enable the /metrics endpoint
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Metrics listen address
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9105".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            addr: default_metrics_addr(),
        }
    }
}

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl MatchingConfig {
    /// Load configuration from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
