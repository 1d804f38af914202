//! Memory KV Store (Log-Backed)
//!
//! An in-memory ordered map made durable by an operation log plus periodic
//! full snapshots, both written to a raw disk queue. This is the index store
//! the spill pipeline writes into: small enough to live in memory, durable
//! enough to anchor recovery.
//!
//! ## How Durability Works
//!
//! Writes buffer into an **op queue** (set / clear-range / clear-to-end) and
//! apply to the in-memory map immediately (read-your-writes). Each applied
//! batch is also logged; `commit` appends an `OpCommit` marker and fsyncs the
//! backing queue. Recovery replays the log, applying batches only at their
//! `OpCommit`, so a torn tail rolls back cleanly.
//!
//! Concurrently, a background task streams the whole map into the log as
//! `OpSnapshotItem` records, finishing with `OpSnapshotEnd`. The two most
//! recent snapshot-end locations are retained; once a commit is durable the
//! older one is popped from the queue, bounding log replay to (roughly) one
//! snapshot plus the ops since.
//!
//! ## Operation Record Layout
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────┬────────┬────────────┐
//! │ op (u32) │ len1(u32)│ len2(u32)│ p1     │ p2     │ 0x01       │
//! └──────────┴──────────┴──────────┴────────┴────────┴────────────┘
//! ```
//!
//! The trailing byte distinguishes real records from zero-fill written over
//! a torn tail.
//!
//! ## Large Transactions
//!
//! When one uncommitted transaction exceeds half the last committed map
//! size, logging each op would roughly rewrite the store; instead the store
//! flips to "large" mode, applies further writes directly, and the next
//! commit logs a fresh full snapshot (`OpClearToEnd` + every item).
//!
//! ## Out of Space
//!
//! With no bytes left, writes return without effect and `commit` never
//! resolves: the instance wedges deliberately until an operator extends
//! storage, rather than acknowledging commits it cannot keep.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taglog_core::{Error, Result, StorageBytes, Uid};

use crate::disk_queue::{DiskQueue, Location};
use crate::kv::{KeyValue, KeyValueStore};

const OP_HEADER_LEN: usize = 12;
/// Header plus terminator byte, charged per logged op.
const OP_DISK_OVERHEAD: i64 = OP_HEADER_LEN as i64 + 1;
/// Accounting overhead per resident map entry.
const ENTRY_OVERHEAD: i64 = 72;
/// Per-row overhead charged against a range read's byte limit.
const RANGE_READ_ROW_OVERHEAD: usize = 32;
/// Lengths beyond this are treated as corruption, not allocation requests.
const MAX_OP_LEN: u32 = 100 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpType {
    Set = 0,
    Clear = 1,
    ClearToEnd = 2,
    SnapshotItem = 3,
    SnapshotEnd = 4,
    SnapshotAbort = 5,
    Commit = 6,
    Rollback = 7,
}

impl OpType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => OpType::Set,
            1 => OpType::Clear,
            2 => OpType::ClearToEnd,
            3 => OpType::SnapshotItem,
            4 => OpType::SnapshotEnd,
            5 => OpType::SnapshotAbort,
            6 => OpType::Commit,
            7 => OpType::Rollback,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct Op {
    op: OpType,
    p1: Bytes,
    p2: Bytes,
}

#[derive(Debug, Default)]
struct OpQueue {
    ops: Vec<Op>,
    bytes: i64,
}

impl OpQueue {
    fn push(&mut self, op: OpType, p1: Bytes, p2: Bytes) {
        self.bytes += p1.len() as i64 + p2.len() as i64 + OP_DISK_OVERHEAD;
        self.ops.push(Op { op, p1, p2 });
    }

    fn set(&mut self, key: Bytes, value: Bytes) {
        self.push(OpType::Set, key, value);
    }

    fn clear(&mut self, begin: Bytes, end: Bytes) {
        self.push(OpType::Clear, begin, end);
    }

    fn clear_to_end(&mut self, from: Bytes) {
        self.push(OpType::ClearToEnd, from, Bytes::new());
    }

    fn rollback(&mut self) {
        self.ops.clear();
        self.bytes = 0;
    }

    fn total_size(&self) -> i64 {
        self.bytes
    }
}

#[derive(Debug)]
struct MemKvState {
    data: BTreeMap<Bytes, Bytes>,
    /// Sum of key + value + per-entry overhead over `data`.
    data_bytes: i64,

    queue: OpQueue,
    committed_write_bytes: i64,
    committed_data_size: i64,
    transaction_size: i64,
    transaction_is_large: bool,

    /// Where the in-progress snapshot should resume after recovery.
    recovered_snapshot_key: Bytes,
    current_snapshot_end: Option<Location>,
    previous_snapshot_end: Option<Location>,
    reset_snapshot: bool,
    snapshot_count: u64,

    reported_out_of_space: bool,
}

/// The log-backed in-memory KV store.
pub struct MemKvStore {
    id: Uid,
    log: Arc<DiskQueue>,
    memory_limit: i64,
    state: Mutex<MemKvState>,
    /// Total committed write bytes; paces the snapshot task.
    notified_write_bytes: watch::Sender<i64>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemKvStore {
    /// Open the store, replaying its log, and start the snapshot task.
    pub async fn open(
        path: impl AsRef<Path>,
        id: Uid,
        memory_limit: i64,
        disk_budget: i64,
    ) -> Result<Arc<Self>> {
        let log = Arc::new(DiskQueue::open(path, disk_budget).await?);
        let store = Arc::new(MemKvStore {
            id,
            log,
            memory_limit,
            state: Mutex::new(MemKvState {
                data: BTreeMap::new(),
                data_bytes: 0,
                queue: OpQueue::default(),
                committed_write_bytes: 0,
                committed_data_size: 0,
                transaction_size: 0,
                transaction_is_large: false,
                recovered_snapshot_key: Bytes::new(),
                current_snapshot_end: None,
                previous_snapshot_end: None,
                reset_snapshot: false,
                snapshot_count: 0,
                reported_out_of_space: false,
            }),
            notified_write_bytes: watch::channel(0).0,
            snapshot_task: Mutex::new(None),
        });

        store.recover().await?;

        let task = tokio::spawn(snapshot_loop(store.clone()));
        *store.snapshot_task.lock().unwrap() = Some(task);
        Ok(store)
    }

    fn available_size(&self, st: &MemKvState) -> i64 {
        self.memory_limit - (st.data_bytes + st.queue.total_size() + st.transaction_size)
    }

    /// Append one op record to the backing queue; returns its end location.
    fn log_op(&self, op: OpType, p1: &[u8], p2: &[u8]) -> Location {
        let mut rec = BytesMut::with_capacity(OP_HEADER_LEN + p1.len() + p2.len() + 1);
        rec.extend_from_slice(&(op as u32).to_le_bytes());
        rec.extend_from_slice(&(p1.len() as u32).to_le_bytes());
        rec.extend_from_slice(&(p2.len() as u32).to_le_bytes());
        rec.extend_from_slice(p1);
        rec.extend_from_slice(p2);
        rec.extend_from_slice(&[1u8]);
        let (_, end) = self.log.push(&rec);
        end
    }

    fn apply_set(st: &mut MemKvState, key: Bytes, value: Bytes) {
        let added = key.len() as i64 + value.len() as i64 + ENTRY_OVERHEAD;
        if let Some(old) = st.data.insert(key.clone(), value) {
            st.data_bytes -= key.len() as i64 + old.len() as i64 + ENTRY_OVERHEAD;
        }
        st.data_bytes += added;
    }

    fn apply_clear(st: &mut MemKvState, begin: &[u8], end: Option<&[u8]>) {
        let doomed: Vec<Bytes> = match end {
            Some(end) => st
                .data
                .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
                .map(|(k, _)| k.clone())
                .collect(),
            None => st
                .data
                .range::<[u8], _>((Bound::Included(begin), Bound::Unbounded))
                .map(|(k, _)| k.clone())
                .collect(),
        };
        for k in doomed {
            if let Some(v) = st.data.remove(&k) {
                st.data_bytes -= k.len() as i64 + v.len() as i64 + ENTRY_OVERHEAD;
            }
        }
    }

    fn apply_op(st: &mut MemKvState, op: &Op) {
        match op.op {
            OpType::Set => Self::apply_set(st, op.p1.clone(), op.p2.clone()),
            OpType::Clear => Self::apply_clear(st, &op.p1, Some(&op.p2)),
            OpType::ClearToEnd => Self::apply_clear(st, &op.p1, None),
            _ => unreachable!("only mutations reach the op queue"),
        }
    }

    /// Apply (and optionally log) every queued op; returns bytes logged.
    fn commit_queue(&self, st: &mut MemKvState, log: bool) -> i64 {
        let ops = std::mem::take(&mut st.queue.ops);
        st.queue.bytes = 0;
        let mut total = 0i64;
        for op in &ops {
            total += op.p1.len() as i64 + op.p2.len() as i64 + OP_DISK_OVERHEAD;
            Self::apply_op(st, op);
            if log {
                self.log_op(op.op, &op.p1, &op.p2);
            }
        }
        total
    }

    /// Apply queued writes to the map and log them, tracking transaction
    /// size and flipping to large-transaction mode when warranted.
    fn semi_commit(&self, st: &mut MemKvState) {
        st.transaction_size += st.queue.total_size();
        if st.transaction_size as f64 > 0.5 * st.committed_data_size as f64 {
            if !st.transaction_is_large {
                info!(
                    id = %self.id,
                    transaction_size = st.transaction_size,
                    data_size = st.committed_data_size,
                    "memkv switching to large transaction mode"
                );
            }
            st.transaction_is_large = true;
        }
        let bytes_written = self.commit_queue(st, true);
        st.committed_write_bytes += bytes_written;
    }

    /// Log a complete replacement snapshot of the current map.
    fn full_snapshot(&self, st: &mut MemKvState) {
        st.previous_snapshot_end = Some(self.log_op(OpType::SnapshotAbort, b"", b""));
        st.reset_snapshot = true;
        self.log_op(OpType::ClearToEnd, b"", b"");

        let mut items = 0u64;
        let mut snapshot_bytes = 0i64;
        for (k, v) in &st.data {
            self.log_op(OpType::SnapshotItem, k, v);
            snapshot_bytes += k.len() as i64 + v.len() as i64 + OP_DISK_OVERHEAD;
            items += 1;
        }
        st.current_snapshot_end = Some(self.log_op(OpType::SnapshotEnd, b"", b""));
        st.snapshot_count += 1;
        // The incremental snapshotter restarts from scratch; its pacing
        // counter must not race ahead of what was just written.
        st.committed_write_bytes = *self.notified_write_bytes.borrow();
        debug!(id = %self.id, items, snapshot_bytes, "memkv full snapshot");
    }

    /// Replay the backing log into the map.
    async fn recover(&self) -> Result<()> {
        self.log.initialize_recovery(0);

        // `uncommitted_*` track state that an OpRollback discards; OpCommit
        // promotes them into the committed fields.
        let mut uncommitted_next_key = Bytes::new();
        let mut uncommitted_prev_snapshot_end = self.log.next_read_location();
        let mut uncommitted_snapshot_end = uncommitted_prev_snapshot_end;
        {
            let mut st = self.state.lock().unwrap();
            st.previous_snapshot_end = Some(uncommitted_prev_snapshot_end);
            st.current_snapshot_end = Some(uncommitted_snapshot_end);
        }

        let mut shadow = OpQueue::default();
        let mut zero_fill = 0usize;
        let mut commits = 0u64;
        let mut snapshot_items = 0u64;

        info!(id = %self.id, start = uncommitted_snapshot_end, "memkv recovery started");

        loop {
            let header = self.log.read_next(OP_HEADER_LEN).await?;
            if header.len() != OP_HEADER_LEN {
                if !header.is_empty() {
                    let mut padded = [0u8; OP_HEADER_LEN];
                    padded[..header.len()].copy_from_slice(&header);
                    let len1 = u32::from_le_bytes(padded[4..8].try_into().unwrap());
                    let len2 = u32::from_le_bytes(padded[8..12].try_into().unwrap());
                    zero_fill = OP_HEADER_LEN - header.len() + (len1 + len2) as usize + 1;
                }
                break;
            }
            let mut h = &header[..];
            let op_code = h.get_u32_le();
            let len1 = h.get_u32_le();
            let len2 = h.get_u32_le();
            if len1 > MAX_OP_LEN || len2 > MAX_OP_LEN {
                return Err(Error::CorruptRecord(format!(
                    "implausible op lengths {len1}/{len2}"
                )));
            }

            let body = self.log.read_next((len1 + len2) as usize + 1).await?;
            if body.len() != (len1 + len2) as usize + 1 {
                zero_fill = (len1 + len2) as usize + 1 - body.len();
                break;
            }

            if body[body.len() - 1] == 0 {
                // Zero-filled record from an earlier torn-tail repair.
                continue;
            }

            let p1 = body.slice(..len1 as usize);
            let p2 = body.slice(len1 as usize..(len1 + len2) as usize);
            let op = OpType::from_u32(op_code).ok_or_else(|| {
                Error::CorruptRecord(format!("unknown op code {op_code}"))
            })?;

            match op {
                OpType::SnapshotItem => {
                    // The snapshot stream is ordered; keys that disappeared
                    // since it started show up as gaps to clear.
                    if p1 >= uncommitted_next_key {
                        shadow.clear(uncommitted_next_key.clone(), p1.clone());
                    }
                    shadow.set(p1.clone(), p2);
                    uncommitted_next_key = key_after(&p1);
                    snapshot_items += 1;
                }
                OpType::SnapshotEnd | OpType::SnapshotAbort => {
                    if op == OpType::SnapshotEnd {
                        uncommitted_prev_snapshot_end = uncommitted_snapshot_end;
                        uncommitted_snapshot_end = self.log.next_read_location();
                        shadow.clear_to_end(uncommitted_next_key.clone());
                    }
                    uncommitted_next_key = Bytes::new();
                }
                OpType::Set => shadow.set(p1, p2),
                OpType::Clear => shadow.clear(p1, p2),
                OpType::ClearToEnd => shadow.clear_to_end(p1),
                OpType::Commit => {
                    let mut st = self.state.lock().unwrap();
                    let applied = std::mem::take(&mut shadow);
                    for op in &applied.ops {
                        Self::apply_op(&mut st, op);
                    }
                    st.recovered_snapshot_key = uncommitted_next_key.clone();
                    st.previous_snapshot_end = Some(uncommitted_prev_snapshot_end);
                    st.current_snapshot_end = Some(uncommitted_snapshot_end);
                    commits += 1;
                }
                OpType::Rollback => {
                    shadow.rollback();
                    let st = self.state.lock().unwrap();
                    uncommitted_next_key = st.recovered_snapshot_key.clone();
                    uncommitted_prev_snapshot_end =
                        st.previous_snapshot_end.unwrap_or(uncommitted_prev_snapshot_end);
                    uncommitted_snapshot_end =
                        st.current_snapshot_end.unwrap_or(uncommitted_snapshot_end);
                }
            }
        }

        if zero_fill > 0 {
            warn!(id = %self.id, zero_fill, "repairing torn record at memkv log tail");
            self.log.push(&vec![0u8; zero_fill]);
        }

        // Anything after the last OpCommit is discarded; make sure a fresh
        // startup sees that explicitly.
        self.log_op(OpType::Rollback, b"", b"");

        let mut st = self.state.lock().unwrap();
        st.committed_data_size = st.data_bytes;
        info!(
            id = %self.id,
            commits,
            snapshot_items,
            entries = st.data.len(),
            "memkv recovery complete"
        );
        Ok(())
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }

    #[cfg(test)]
    fn snapshot_count(&self) -> u64 {
        self.state.lock().unwrap().snapshot_count
    }

    #[cfg(test)]
    fn is_large_transaction(&self) -> bool {
        self.state.lock().unwrap().transaction_is_large
    }
}

#[async_trait]
impl KeyValueStore for MemKvStore {
    async fn init(&self) -> Result<()> {
        // Recovery completes inside `open`.
        Ok(())
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        let mut st = self.state.lock().unwrap();
        // A commit with no space never resolves, so dropped writes are never
        // acknowledged.
        if self.available_size(&st) <= 0 {
            return;
        }
        if st.transaction_is_large {
            let bytes = key.len() as i64 + value.len() as i64 + ENTRY_OVERHEAD;
            Self::apply_set(
                &mut st,
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
            );
            st.transaction_size += bytes;
        } else {
            st.queue
                .set(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
            self.semi_commit(&mut st);
        }
    }

    fn clear(&self, key: &[u8]) {
        self.clear_range(key, &key_after(key));
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut st = self.state.lock().unwrap();
        if self.available_size(&st) <= 0 {
            return;
        }
        if st.transaction_is_large {
            Self::apply_clear(&mut st, begin, Some(end));
        } else {
            st.queue
                .clear(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end));
            self.semi_commit(&mut st);
        }
    }

    async fn read_value(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let st = self.state.lock().unwrap();
        Ok(st.data.get(key).cloned())
    }

    async fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        row_limit: i32,
        byte_limit: usize,
    ) -> Result<Vec<KeyValue>> {
        let st = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut bytes_left = byte_limit as i64;
        let range = st
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)));
        if row_limit >= 0 {
            let mut rows_left = row_limit;
            for (k, v) in range {
                if rows_left == 0 || bytes_left < 0 {
                    break;
                }
                bytes_left -= (RANGE_READ_ROW_OVERHEAD + k.len() + v.len()) as i64;
                out.push((k.clone(), v.clone()));
                rows_left -= 1;
            }
        } else {
            let mut rows_left = -row_limit;
            for (k, v) in range.rev() {
                if rows_left == 0 || bytes_left < 0 {
                    break;
                }
                bytes_left -= (RANGE_READ_ROW_OVERHEAD + k.len() + v.len()) as i64;
                out.push((k.clone(), v.clone()));
                rows_left -= 1;
            }
        }
        Ok(out)
    }

    async fn commit(&self) -> Result<()> {
        let previous_snapshot_end = {
            let mut st = self.state.lock().unwrap();
            if self.available_size(&st) <= 0 {
                if !st.reported_out_of_space {
                    st.reported_out_of_space = true;
                    error!(id = %self.id, "memkv out of space; commit stalled");
                }
                None
            } else {
                if st.transaction_is_large {
                    self.full_snapshot(&mut st);
                    self.log_op(OpType::Commit, b"", b"");
                } else {
                    let bytes_written = self.commit_queue(&mut st, true);
                    if bytes_written > 0
                        || st.committed_write_bytes > *self.notified_write_bytes.borrow()
                    {
                        st.committed_write_bytes += bytes_written + OP_DISK_OVERHEAD;
                        // Publishing the write-bytes total wakes the snapshot
                        // task; do it before the OpCommit lands.
                        self.notified_write_bytes.send_replace(st.committed_write_bytes);
                        self.log_op(OpType::Commit, b"", b"");
                    }
                }

                st.committed_data_size = st.data_bytes;
                st.transaction_size = 0;
                st.transaction_is_large = false;
                Some(st.previous_snapshot_end)
            }
        };

        let previous_snapshot_end = match previous_snapshot_end {
            Some(v) => v,
            // Deliberate stall: resolves only when storage is extended,
            // which in this build means never.
            None => return futures::future::pending().await,
        };

        self.log.commit().await?;

        // Only once the commit is durable may the pre-previous snapshot go.
        if let Some(loc) = previous_snapshot_end {
            self.log.pop(loc);
        }
        Ok(())
    }

    fn storage_bytes(&self) -> StorageBytes {
        let st = self.state.lock().unwrap();
        let disk = self.log.storage_bytes();
        let uncommitted = st.queue.total_size() + st.transaction_size;
        let avail_mem = self.available_size(&st);
        StorageBytes {
            free: avail_mem.min(disk.free / 4 - uncommitted).max(0),
            total: self.memory_limit.min(disk.total / 4 - uncommitted),
            used: disk.used,
            available: avail_mem.min(disk.available / 4 - uncommitted).max(0),
        }
    }

    fn close(&self) {
        if let Some(task) = self.snapshot_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn dispose(&self) {
        self.close();
        if let Err(e) = std::fs::remove_file(self.log.path()) {
            warn!(id = %self.id, error = %e, "failed to delete memkv log file");
        }
    }
}

/// First key after `k` in lexicographic order.
fn key_after(k: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(k.len() + 1);
    out.extend_from_slice(k);
    out.extend_from_slice(&[0]);
    out.freeze()
}

/// Streams the map into the log one item per committed-write wakeup, so
/// snapshot I/O tracks (and never outruns) foreground write volume.
async fn snapshot_loop(store: Arc<MemKvStore>) {
    let mut rx = store.notified_write_bytes.subscribe();
    let mut written: i64 = 0;
    let mut next_key: Bytes = store.state.lock().unwrap().recovered_snapshot_key.clone();
    let mut key_is_exclusive = false;

    loop {
        let target = written + 1;
        if rx.wait_for(|total| *total >= target).await.is_err() {
            return;
        }

        let mut st = store.state.lock().unwrap();
        if st.reset_snapshot {
            next_key = Bytes::new();
            key_is_exclusive = false;
            st.reset_snapshot = false;
        }

        let bound = if key_is_exclusive {
            Bound::Excluded(&next_key[..])
        } else {
            Bound::Included(&next_key[..])
        };
        let next = st
            .data
            .range::<[u8], _>((bound, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));

        match next {
            None => {
                let end = store.log_op(OpType::SnapshotEnd, b"", b"");
                st.previous_snapshot_end = st.current_snapshot_end;
                st.current_snapshot_end = Some(end);
                st.snapshot_count += 1;
                next_key = Bytes::new();
                key_is_exclusive = false;
                written += OP_DISK_OVERHEAD;
                debug!(id = %store.id, count = st.snapshot_count, "memkv snapshot complete");
            }
            Some((k, v)) => {
                store.log_op(OpType::SnapshotItem, &k, &v);
                written += k.len() as i64 + v.len() as i64 + OP_DISK_OVERHEAD;
                next_key = k;
                key_is_exclusive = true;
            }
        }
    }
}
