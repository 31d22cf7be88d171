//! Server configuration and knobs.
//!
//! Every constant the log server's behavior hangs off is a knob with a
//! serde default, so tests can shrink budgets and deployments can tune
//! them. The defaults are sized for production hardware; tests typically
//! override the byte budgets downward to force spilling and backpressure
//! with small workloads.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taglog_storage::DiskQueueConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root directory: the log queue lives in `queue/`, the KV index op
    /// log in `kvlog/`.
    pub data_dir: PathBuf,

    /// Replica locality this server serves (non-negative data-center id).
    #[serde(default)]
    pub locality: i8,

    /// External snapshot helper binary for `snap` exec operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_helper: Option<PathBuf>,

    /// Override the log queue's segment size. Small segments make prefix
    /// reclamation visible with small workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_segment_bytes: Option<u64>,

    #[serde(default)]
    pub knobs: Knobs,
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locality: 0,
            snap_helper: None,
            queue_segment_bytes: None,
            knobs: Knobs::default(),
        }
    }

    pub fn queue_config(&self) -> DiskQueueConfig {
        let mut config = DiskQueueConfig {
            directory: self.data_dir.join("queue"),
            file_prefix: "logqueue".to_string(),
            ..Default::default()
        };
        if let Some(segment_bytes) = self.queue_segment_bytes {
            config.segment_bytes = segment_bytes;
        }
        config
    }

    pub fn kv_queue_config(&self) -> DiskQueueConfig {
        DiskQueueConfig {
            directory: self.data_dir.join("kvlog"),
            file_prefix: "kvlog".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knobs {
    /// Commits stall while `bytes_input - bytes_durable` is at or above
    /// this.
    #[serde(default = "default_hard_limit_bytes")]
    pub hard_limit_bytes: u64,

    /// Spilling starts once unspilled bytes pass this high-water mark (a
    /// stopped generation spills regardless).
    #[serde(default = "default_spill_threshold_bytes")]
    pub spill_threshold_bytes: u64,

    /// Per-iteration spill byte budget.
    #[serde(default = "default_update_storage_byte_limit")]
    pub update_storage_byte_limit: u64,

    /// Reference-spill batch is flushed once it holds this many bytes of
    /// record metadata.
    #[serde(default = "default_spill_reference_max_bytes_per_batch")]
    pub spill_reference_max_bytes_per_batch: usize,

    /// A single peek resolves at most this many reference batches.
    #[serde(default = "default_spill_reference_max_batches_per_peek")]
    pub spill_reference_max_batches_per_peek: usize,

    /// Target reply size for a peek.
    #[serde(default = "default_peek_reply_byte_budget")]
    pub peek_reply_byte_budget: usize,

    /// Sequenced peeks further than this behind the newest sequence are
    /// failed with `timed_out`.
    #[serde(default = "default_parallel_peek_window")]
    pub parallel_peek_window: u64,

    /// Idle peek trackers are dropped after this long.
    #[serde(default = "default_peek_tracker_expiration_ms", with = "duration_ms")]
    pub peek_tracker_expiration: Duration,

    /// Total memory reservable by spilled-peek disk reads.
    #[serde(default = "default_peek_memory_limit_bytes")]
    pub peek_memory_limit_bytes: usize,

    /// Concurrent log-router-tag peeks.
    #[serde(default = "default_concurrent_log_router_reads")]
    pub concurrent_log_router_reads: usize,

    /// During startup replay, spill inline once in-memory bytes pass this.
    #[serde(default = "default_recover_memory_limit")]
    pub recover_memory_limit: u64,

    /// Minimum delay between spill iterations (and after a failed one).
    #[serde(default = "default_update_storage_delay_ms", with = "duration_ms")]
    pub update_storage_delay: Duration,

    /// Commit replies log a warning at this period while waiting for
    /// queue durability.
    #[serde(default = "default_queue_commit_warn_interval_ms", with = "duration_ms")]
    pub queue_commit_warn_interval: Duration,

    /// Staged queue bytes that wake the queue committer early.
    #[serde(default = "default_large_commit_bytes")]
    pub large_commit_bytes: u64,

    /// A queue commit slower than this marks the process degraded.
    #[serde(default = "default_degraded_commit_ms", with = "duration_ms")]
    pub degraded_commit: Duration,

    /// Accounting overhead charged per message held in the tag index
    /// (container bookkeeping, measured, not derived).
    #[serde(default = "default_version_message_overhead_bytes")]
    pub version_message_overhead_bytes: u64,

    /// Bytes of key/value data re-written per KV snapshot step.
    #[serde(default = "default_kv_snapshot_chunk_bytes")]
    pub kv_snapshot_chunk_bytes: usize,

    /// Period of the KV snapshot task.
    #[serde(default = "default_kv_snapshot_interval_ms", with = "duration_ms")]
    pub kv_snapshot_interval: Duration,

    /// Period of the peek-tracker expiry sweep.
    #[serde(default = "default_peek_cleanup_interval_ms", with = "duration_ms")]
    pub peek_cleanup_interval: Duration,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            hard_limit_bytes: default_hard_limit_bytes(),
            spill_threshold_bytes: default_spill_threshold_bytes(),
            update_storage_byte_limit: default_update_storage_byte_limit(),
            spill_reference_max_bytes_per_batch: default_spill_reference_max_bytes_per_batch(),
            spill_reference_max_batches_per_peek: default_spill_reference_max_batches_per_peek(),
            peek_reply_byte_budget: default_peek_reply_byte_budget(),
            parallel_peek_window: default_parallel_peek_window(),
            peek_tracker_expiration: default_peek_tracker_expiration_ms(),
            peek_memory_limit_bytes: default_peek_memory_limit_bytes(),
            concurrent_log_router_reads: default_concurrent_log_router_reads(),
            recover_memory_limit: default_recover_memory_limit(),
            update_storage_delay: default_update_storage_delay_ms(),
            queue_commit_warn_interval: default_queue_commit_warn_interval_ms(),
            large_commit_bytes: default_large_commit_bytes(),
            degraded_commit: default_degraded_commit_ms(),
            version_message_overhead_bytes: default_version_message_overhead_bytes(),
            kv_snapshot_chunk_bytes: default_kv_snapshot_chunk_bytes(),
            kv_snapshot_interval: default_kv_snapshot_interval_ms(),
            peek_cleanup_interval: default_peek_cleanup_interval_ms(),
        }
    }
}

fn default_hard_limit_bytes() -> u64 {
    1_500_000_000
}
fn default_spill_threshold_bytes() -> u64 {
    150_000_000
}
fn default_update_storage_byte_limit() -> u64 {
    100_000_000
}
fn default_spill_reference_max_bytes_per_batch() -> usize {
    16_384
}
fn default_spill_reference_max_batches_per_peek() -> usize {
    100
}
fn default_peek_reply_byte_budget() -> usize {
    150_000
}
fn default_parallel_peek_window() -> u64 {
    32
}
fn default_peek_tracker_expiration_ms() -> Duration {
    Duration::from_secs(600)
}
fn default_peek_memory_limit_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_concurrent_log_router_reads() -> usize {
    8
}
fn default_recover_memory_limit() -> u64 {
    300_000_000
}
fn default_update_storage_delay_ms() -> Duration {
    Duration::from_millis(100)
}
fn default_queue_commit_warn_interval_ms() -> Duration {
    Duration::from_millis(100)
}
fn default_large_commit_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_degraded_commit_ms() -> Duration {
    Duration::from_secs(5)
}
fn default_version_message_overhead_bytes() -> u64 {
    96
}
fn default_kv_snapshot_chunk_bytes() -> usize {
    256 * 1024
}
fn default_kv_snapshot_interval_ms() -> Duration {
    Duration::from_secs(1)
}
fn default_peek_cleanup_interval_ms() -> Duration {
    Duration::from_secs(10)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
