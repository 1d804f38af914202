//! Storage Configuration
//!
//! All tunables of the storage engine in one place. Defaults are production
//! values; tests shrink the spill/backpressure thresholds to exercise the
//! spill and recovery paths with small payloads.
//!
//! ## The Knobs That Matter
//!
//! - **spill_threshold**: once `bytes_input - bytes_durable` exceeds this,
//!   the spill loop starts moving the oldest in-memory versions into the
//!   index store (default: 1.5 GB)
//! - **hard_limit_bytes**: commits stall (backpressure, not error) once the
//!   un-durable window exceeds this (default: 3 GB)
//! - **desired_total_bytes**: target reply size for one peek batch
//! - **max_queue_commit_bytes**: force a disk-queue commit group to be cut
//!   once this many bytes are buffered
//!
//! ## Usage
//!
//! ```ignore
//! use taglog_storage::TLogConfig;
//!
//! let config = TLogConfig {
//!     data_dir: "/var/lib/taglog".into(),
//!     spill_threshold: 64 * 1024, // tiny, for tests
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogConfig {
    /// Directory holding the disk queue and index store files.
    pub data_dir: PathBuf,

    /// Spill once the shared un-durable window reaches this many bytes.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: i64,

    /// Stall commits while the shared un-durable window exceeds this.
    #[serde(default = "default_hard_limit_bytes")]
    pub hard_limit_bytes: i64,

    /// During queue replay, spill before letting memory grow past this.
    #[serde(default = "default_recover_memory_limit")]
    pub recover_memory_limit: i64,

    /// Target byte size of one peek reply batch.
    #[serde(default = "default_desired_total_bytes")]
    pub desired_total_bytes: usize,

    /// Cut a new disk-queue commit group once this much is buffered.
    #[serde(default = "default_max_queue_commit_bytes")]
    pub max_queue_commit_bytes: i64,

    /// Spill pass is considered "caught up" below this many bytes moved.
    #[serde(default = "default_update_storage_byte_limit")]
    pub update_storage_byte_limit: i64,

    /// Per-batch cap on bytes moved by one spill pass.
    #[serde(default = "default_reference_spill_update_storage_byte_limit")]
    pub reference_spill_update_storage_byte_limit: i64,

    /// Cap on one by-reference index row (a batch of spilled pointers).
    #[serde(default = "default_spill_reference_max_bytes_per_batch")]
    pub spill_reference_max_bytes_per_batch: usize,

    /// Cap on index rows decoded by one spilled peek.
    #[serde(default = "default_spill_reference_max_batches_per_peek")]
    pub spill_reference_max_batches_per_peek: usize,

    /// Byte budget for in-flight spilled-peek disk reads (process-wide).
    #[serde(default = "default_spill_reference_max_peek_memory_bytes")]
    pub spill_reference_max_peek_memory_bytes: u64,

    /// Concurrent log-router peeks allowed (they are memory-hungry).
    #[serde(default = "default_concurrent_log_router_reads")]
    pub concurrent_log_router_reads: usize,

    /// Sequenced-peek trackers idle longer than this are garbage collected.
    #[serde(default = "default_peek_tracker_expiration", with = "duration_secs")]
    pub peek_tracker_expiration: Duration,

    /// Sequenced peeks more than this many requests behind are cancelled.
    #[serde(default = "default_parallel_peek_window")]
    pub parallel_peek_window: i32,

    /// Idle sleep of the spill loop.
    #[serde(
        default = "default_storage_min_update_interval",
        with = "duration_secs"
    )]
    pub storage_min_update_interval: Duration,

    /// Breather taken after a peek unblocks on a new version.
    #[serde(default = "default_peek_delay", with = "duration_secs")]
    pub peek_delay: Duration,

    /// Warn when the disk-queue fsync takes longer than this.
    #[serde(default = "default_degraded_duration", with = "duration_secs")]
    pub degraded_duration: Duration,

    /// Nominal message block size, used for accounting.
    #[serde(default = "default_message_block_bytes")]
    pub message_block_bytes: usize,

    /// Overestimate of allocator slack on message blocks.
    #[serde(default = "default_block_overhead_factor")]
    pub block_overhead_factor: f64,

    /// Accounting overhead charged per per-tag index entry.
    #[serde(default = "default_version_message_entry_overhead")]
    pub version_message_entry_overhead: i64,

    /// Messages larger than this are logged as suspicious.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Buffered pops replay automatically after this long in ignore mode.
    #[serde(
        default = "default_ignore_pop_auto_enable_delay",
        with = "duration_secs"
    )]
    pub ignore_pop_auto_enable_delay: Duration,

    /// Memory budget of the index store's in-memory map.
    #[serde(default = "default_kv_memory_limit")]
    pub kv_memory_limit: i64,

    /// Disk budget reported for the queue files.
    #[serde(default = "default_queue_disk_budget")]
    pub queue_disk_budget: i64,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?))
    }
}

impl Default for TLogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/taglog"),
            spill_threshold: default_spill_threshold(),
            hard_limit_bytes: default_hard_limit_bytes(),
            recover_memory_limit: default_recover_memory_limit(),
            desired_total_bytes: default_desired_total_bytes(),
            max_queue_commit_bytes: default_max_queue_commit_bytes(),
            update_storage_byte_limit: default_update_storage_byte_limit(),
            reference_spill_update_storage_byte_limit:
                default_reference_spill_update_storage_byte_limit(),
            spill_reference_max_bytes_per_batch: default_spill_reference_max_bytes_per_batch(),
            spill_reference_max_batches_per_peek: default_spill_reference_max_batches_per_peek(),
            spill_reference_max_peek_memory_bytes: default_spill_reference_max_peek_memory_bytes(),
            concurrent_log_router_reads: default_concurrent_log_router_reads(),
            peek_tracker_expiration: default_peek_tracker_expiration(),
            parallel_peek_window: default_parallel_peek_window(),
            storage_min_update_interval: default_storage_min_update_interval(),
            peek_delay: default_peek_delay(),
            degraded_duration: default_degraded_duration(),
            message_block_bytes: default_message_block_bytes(),
            block_overhead_factor: default_block_overhead_factor(),
            version_message_entry_overhead: default_version_message_entry_overhead(),
            max_message_size: default_max_message_size(),
            ignore_pop_auto_enable_delay: default_ignore_pop_auto_enable_delay(),
            kv_memory_limit: default_kv_memory_limit(),
            queue_disk_budget: default_queue_disk_budget(),
        }
    }
}

impl TLogConfig {
    /// A configuration sized for unit tests: small thresholds, fast timers.
    pub fn small_for_tests(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            spill_threshold: 32 * 1024,
            hard_limit_bytes: 256 * 1024 * 1024,
            recover_memory_limit: 256 * 1024,
            reference_spill_update_storage_byte_limit: 256 * 1024,
            spill_reference_max_bytes_per_batch: 1024,
            storage_min_update_interval: Duration::from_millis(20),
            kv_memory_limit: 64 * 1024 * 1024,
            ..Default::default()
        }
    }
}

fn default_spill_threshold() -> i64 {
    1_500_000_000
}
fn default_hard_limit_bytes() -> i64 {
    3_000_000_000
}
fn default_recover_memory_limit() -> i64 {
    default_spill_threshold() + default_hard_limit_bytes()
}
fn default_desired_total_bytes() -> usize {
    150_000
}
fn default_max_queue_commit_bytes() -> i64 {
    15_000_000
}
fn default_update_storage_byte_limit() -> i64 {
    1_000_000
}
fn default_reference_spill_update_storage_byte_limit() -> i64 {
    20_000_000
}
fn default_spill_reference_max_bytes_per_batch() -> usize {
    16 << 10
}
fn default_spill_reference_max_batches_per_peek() -> usize {
    100
}
fn default_spill_reference_max_peek_memory_bytes() -> u64 {
    2 << 30
}
fn default_concurrent_log_router_reads() -> usize {
    5
}
fn default_peek_tracker_expiration() -> Duration {
    Duration::from_secs(600)
}
fn default_parallel_peek_window() -> i32 {
    32
}
fn default_storage_min_update_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_peek_delay() -> Duration {
    Duration::from_micros(50)
}
fn default_degraded_duration() -> Duration {
    Duration::from_secs(5)
}
fn default_message_block_bytes() -> usize {
    10 << 20
}
fn default_block_overhead_factor() -> f64 {
    1.1
}
fn default_version_message_entry_overhead() -> i64 {
    32
}
fn default_max_message_size() -> usize {
    10 << 20
}
fn default_ignore_pop_auto_enable_delay() -> Duration {
    Duration::from_secs(300)
}
fn default_kv_memory_limit() -> i64 {
    1 << 30
}
fn default_queue_disk_budget() -> i64 {
    50 << 30
}
