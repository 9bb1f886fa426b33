use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// One immutable configuration value built at startup and handed to each
/// component constructor; nothing reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub ship: Option<ShipConfig>,
    #[serde(default)]
    pub stream: Option<StreamConfig>,
    #[serde(default)]
    pub forward: Option<ForwardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub address: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_pool_size() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

/// File-tailing mode: a static topic-to-path map plus an optional watched
/// directory for dynamically discovered files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipConfig {
    #[serde(default)]
    pub files: HashMap<String, PathBuf>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_file_batch_limit")]
    pub batch_limit: usize,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_checkpoint_interval")]
    pub checkpoint_interval: Duration,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_batch_limit() -> usize {
    100
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub dir: PathBuf,
    pub topic: String,
    /// Base names not matching this pattern are never tailed.
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_watch_backoff")]
    pub backoff: Duration,
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_watch_backoff() -> Duration {
    Duration::from_secs(10)
}

/// Network ingestion mode: UDP and/or TCP listeners feeding one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub topic: String,
    #[serde(default)]
    pub udp_listen: Option<String>,
    #[serde(default)]
    pub tcp_listen: Option<String>,
    #[serde(default = "default_stream_batch_limit")]
    pub batch_limit: usize,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

fn default_stream_batch_limit() -> usize {
    20
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

/// External KV store the drop rules are refreshed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub address: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub key_prefix: String,
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(600)
}

/// Reverse path: broker subscription re-delivered to downstream TCP
/// consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub topic: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub listen: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_channel() -> String {
    "logship".to_string()
}

fn default_max_in_flight() -> usize {
    200
}
