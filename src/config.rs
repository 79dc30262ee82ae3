//! Runtime configuration
//!
//! Tunables for the executor, pools, batched IO, resource monitor, and
//! shared-memory store. Loaded from TOML with per-field defaults so a
//! partial file (or none at all) always yields a working config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the resource runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub shm: ShmConfig,
}

impl RuntimeConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `ARBBOT_CONFIG_PATH` or the default path, falling back
    /// to defaults when the file is absent or malformed.
    pub fn from_env() -> Self {
        let path = std::env::var("ARBBOT_CONFIG_PATH")
            .unwrap_or_else(|_| "arbbot_core.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default runtime config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Work-stealing executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of worker lanes (0 = one per available core).
    #[serde(default)]
    pub workers: usize,

    /// A peer lane must hold more than this many tasks before an idle
    /// worker will steal from it.
    #[serde(default = "default_steal_threshold")]
    pub steal_threshold: usize,

    /// Hard ceiling on process CPU (%); throttle backoff never pushes
    /// effective usage above this.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,

    /// Process CPU (%) above which workers back off before picking up
    /// new tasks.
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: f32,

    /// Sleep inserted per throttle event.
    #[serde(default = "default_throttle_backoff_ms")]
    pub throttle_backoff_ms: u64,

    /// Idle poll interval for empty lanes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Default delay between task retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Maximum queued-plus-running tasks; submissions past this are
    /// rejected with `QueueFull`.
    #[serde(default = "default_executor_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_steal_threshold() -> usize {
    5
}
fn default_max_cpu_percent() -> f32 {
    85.0
}
fn default_throttle_threshold() -> f32 {
    70.0
}
fn default_throttle_backoff_ms() -> u64 {
    50
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_executor_queue_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            steal_threshold: default_steal_threshold(),
            max_cpu_percent: default_max_cpu_percent(),
            throttle_threshold: default_throttle_threshold(),
            throttle_backoff_ms: default_throttle_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            queue_capacity: default_executor_queue_capacity(),
        }
    }
}

impl ExecutorConfig {
    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_millis(self.throttle_backoff_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Object pool defaults (per-pool values override these).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub default_max_size: usize,

    #[serde(default = "default_pool_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_pool_max_size() -> usize {
    16
}
fn default_pool_ttl_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_max_size: default_pool_max_size(),
            default_ttl_secs: default_pool_ttl_secs(),
        }
    }
}

impl PoolConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Batched IO manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Batch fires as soon as this many requests are queued.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Batch also fires once a non-empty queue has waited this long.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Maximum pending requests per queue; producers wait when full.
    #[serde(default = "default_io_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent filesystem operations per batch.
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
}

fn default_max_batch_size() -> usize {
    32
}
fn default_batch_interval_ms() -> u64 {
    100
}
fn default_io_queue_capacity() -> usize {
    1024
}
fn default_io_workers() -> usize {
    4
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            queue_capacity: default_io_queue_capacity(),
            io_workers: default_io_workers(),
        }
    }
}

impl IoConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

/// Resource monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Bounded length of the usage-history ring.
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// System memory (%) above which a reclaim pass is forced.
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f32,

    /// Process CPU (%) above which the monitor warns (throttling itself
    /// is enforced inside the executor).
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
}

fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_history_len() -> usize {
    300
}
fn default_max_memory_percent() -> f32 {
    85.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            history_len: default_history_len(),
            max_memory_percent: default_max_memory_percent(),
            max_cpu_percent: default_max_cpu_percent(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Shared-memory store layout and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Directory holding region files, lock sentinels, and the registry.
    #[serde(default = "default_shm_root")]
    pub root_dir: String,

    /// Bounded wait for region/registry lock files before
    /// `LockAcquisition` is raised.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Size of lazily-created metric/state regions.
    #[serde(default = "default_region_size")]
    pub default_region_size: usize,

    /// Staleness TTL for metric types without an explicit override.
    #[serde(default = "default_metrics_ttl_secs")]
    pub default_metrics_ttl_secs: u64,
}

fn default_shm_root() -> String {
    "/tmp/arbbot_shm".to_string()
}
fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_region_size() -> usize {
    65536
}
fn default_metrics_ttl_secs() -> u64 {
    30
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            root_dir: default_shm_root(),
            lock_timeout_ms: default_lock_timeout_ms(),
            default_region_size: default_region_size(),
            default_metrics_ttl_secs: default_metrics_ttl_secs(),
        }
    }
}

impl ShmConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn default_metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.default_metrics_ttl_secs)
    }
}
