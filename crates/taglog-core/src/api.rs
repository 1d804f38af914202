//! Request and Reply Schemas
//!
//! These are the operations a TagLog server exposes. The transport is out of
//! scope here: a deployment wires these structs to whatever RPC layer it
//! uses, and tests call the server's async methods directly.
//!
//! ## Operations
//!
//! - **Commit**: push a batch of framed messages at a version. Replies only
//!   after the batch is durable on the log queue.
//! - **Peek**: tag-filtered, version-bounded streaming read with an optional
//!   per-peer ordering sequence.
//! - **Pop**: consumer acknowledgement that data up to a version is no longer
//!   needed for a tag.
//! - **Lock**: first stage of recovery by a new generation; stops commit
//!   acceptance and drains queue durability.
//! - **QueuingMetrics / ConfirmRunning / RecoveryFinished**: health and
//!   lifecycle probes.

use bytes::Bytes;

use crate::tag::Tag;
use crate::uid::Uid;
use crate::Version;

/// Push a committed mutation batch at `version`.
///
/// `prev_version` must equal the previous accepted version on the instance;
/// a request whose `prev_version` is behind the instance's version is a
/// duplicate retry and succeeds without appending again.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    /// Concatenated framed messages (see [`crate::message`]).
    pub messages: Bytes,
    pub has_exec_op: bool,
    pub debug_id: Option<Uid>,
}

/// Read messages for one tag starting at `begin`.
#[derive(Debug, Clone)]
pub struct PeekRequest {
    pub begin: Version,
    pub tag: Tag,
    /// Fail with `EndOfStream` instead of blocking when no data is ready.
    pub return_if_blocked: bool,
    /// Serve only data already spilled to the index store.
    pub only_spilled: bool,
    /// `(peer id, sequence number)` for strict in-order delivery per peer.
    pub sequence: Option<(Uid, i32)>,
}

/// Reply to a peek: a batch of per-version message groups plus a cursor.
#[derive(Debug, Clone)]
pub struct PeekReply {
    /// Concatenated `i32(-1) | version | framed messages...` groups.
    pub messages: Bytes,
    /// All messages for the tag in `[begin, end)` are included; continue at
    /// `end`.
    pub end: Version,
    /// Set when the requested range was already popped.
    pub popped: Option<Version>,
    pub max_known_version: Version,
    pub min_known_committed_version: Version,
    /// Echo of the (possibly sequence-substituted) begin version.
    pub begin: Option<Version>,
    /// True when the reply was cut short at the spilled/in-memory boundary.
    pub only_spilled: bool,
}

/// Acknowledge consumption of `tag` up to (but not including) `to`.
#[derive(Debug, Clone, Copy)]
pub struct PopRequest {
    pub tag: Tag,
    pub to: Version,
    pub durable_known_committed_version: Version,
}

/// Result of locking an instance for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockResult {
    pub end: Version,
    pub known_committed_version: Version,
}

/// Disk/memory occupancy of a durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageBytes {
    pub free: i64,
    pub total: i64,
    pub used: i64,
    pub available: i64,
}

/// Queue depth report used by upstream admission control.
#[derive(Debug, Clone)]
pub struct QueuingMetricsReply {
    pub local_time: f64,
    /// Changes whenever `bytes_durable`/`bytes_input` reset (process restart).
    pub instance_id: i64,
    pub bytes_durable: i64,
    pub bytes_input: i64,
    pub storage_bytes: StorageBytes,
    /// The durable known-committed version.
    pub v: Version,
}

/// Recruit a new log instance in this process.
///
/// `recovering` selects between a brand-new instance (fresh database) and an
/// instance that will serve versions recovered from a previous generation:
/// for the latter, `start_version..=recover_at` is the recovered span and
/// `all_tags` the tags whose recovered data must be popped before recovery
/// completes.
#[derive(Debug, Clone)]
pub struct InitializeRequest {
    pub recruitment_id: Uid,
    pub epoch: u64,
    pub recovering: bool,
    pub start_version: Version,
    pub recover_at: Version,
    pub known_committed_version: Version,
    pub all_tags: Vec<Tag>,
    pub locality: i8,
    pub log_router_tags: i32,
    pub is_primary: bool,
}

impl InitializeRequest {
    /// A brand-new primary instance hosting regional locality `locality`.
    pub fn fresh(locality: i8) -> Self {
        InitializeRequest {
            recruitment_id: Uid::random(),
            epoch: 0,
            recovering: false,
            start_version: 0,
            recover_at: 0,
            known_committed_version: 0,
            all_tags: Vec::new(),
            locality,
            log_router_tags: 0,
            is_primary: true,
        }
    }
}
