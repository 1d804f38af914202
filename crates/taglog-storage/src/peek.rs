//! Peek Pipeline
//!
//! Serves tag-filtered, version-bounded reads of the message stream. A peek
//! merges three sources, oldest first:
//!
//! 1. **Spilled by value** (txs tag): rows read straight out of the index
//!    store.
//! 2. **Spilled by reference** (all other tags): `SpilledData` pointers from
//!    the index store, resolved by parallel positional reads against the
//!    disk queue, re-filtered per tag.
//! 3. **In memory**: the tag's deque, walked from
//!    `max(begin, persistent_data_durable_version + 1)`.
//!
//! Replies are size-bounded by `desired_total_bytes` and carry a
//! continuation cursor `end`; a reply cut short inside the spilled span sets
//! `only_spilled` so the consumer knows more spilled data remains.
//!
//! ## Sequenced Peeks
//!
//! A peer that pipelines peeks sets `sequence = (peer id, n)`. The server
//! holds request `n` until request `n-1`'s reply cursor is known, then
//! substitutes that cursor as `begin` - so replies form a gapless chain per
//! peer even when requests race. Sequences that fall behind the window are
//! cancelled with `TimedOut`; idle trackers are garbage collected.
//!
//! Suspension points: sequence ordering, version availability
//! (`begin > version`), the log-router read semaphore, the spilled-read
//! memory reservation, and disk reads.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use taglog_core::message::{filter_for_tag, put_version_group_header};
use taglog_core::{Error, PeekReply, PeekRequest, Result, Tag, Uid, Version};

use crate::instance::Instance;
use crate::keys;
use crate::log_queue::decode_framed_entry;
use crate::server::Shared;

/// Outcome slot for one sequence number of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqState {
    Pending,
    /// The reply cursor of the previous request in the chain.
    Set(Version),
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct SeqSlot {
    tx: watch::Sender<SeqState>,
}

impl SeqSlot {
    fn new() -> Self {
        Self {
            tx: watch::channel(SeqState::Pending).0,
        }
    }

    fn get(&self) -> SeqState {
        *self.tx.borrow()
    }

    fn set(&self, state: SeqState) {
        self.tx.send_if_modified(|cur| {
            if *cur == SeqState::Pending {
                *cur = state;
                true
            } else {
                false
            }
        });
    }

    fn subscribe(&self) -> watch::Receiver<SeqState> {
        self.tx.subscribe()
    }
}

#[derive(Debug)]
pub(crate) struct PeekTrackerEntry {
    pub sequences: BTreeMap<i32, SeqSlot>,
    pub last_update: Instant,
}

impl Default for PeekTrackerEntry {
    fn default() -> Self {
        Self {
            sequences: BTreeMap::new(),
            last_update: Instant::now(),
        }
    }
}

pub(crate) type PeekTracker = HashMap<Uid, PeekTrackerEntry>;

/// Resolve the sequence chain: wait for request `seq - 1`'s cursor and
/// substitute it as this request's begin version.
async fn await_sequence_turn(
    shared: &Shared,
    peer: Uid,
    seq: i32,
    begin: &mut Version,
) -> Result<()> {
    let rx = {
        let mut trackers = shared.peek_tracker.lock().unwrap();
        let entry = trackers.entry(peer).or_default();
        entry.last_update = Instant::now();
        if seq == 0 {
            return Ok(());
        }

        // Sequences that fell behind the pipeline window are abandoned.
        let horizon = seq.saturating_sub(shared.config.parallel_peek_window);
        let doomed: Vec<i32> = entry
            .sequences
            .keys()
            .take_while(|&&s| s <= horizon)
            .copied()
            .collect();
        for s in doomed {
            if let Some(slot) = entry.sequences.remove(&s) {
                slot.set(SeqState::TimedOut);
            }
        }

        if let Some((&first, _)) = entry.sequences.iter().next() {
            if seq < first {
                return Err(Error::TimedOut);
            }
        }

        entry
            .sequences
            .entry(seq)
            .or_insert_with(SeqSlot::new)
            .subscribe()
    };

    let mut rx = rx;
    let state = match rx.wait_for(|s| *s != SeqState::Pending).await {
        Ok(state) => *state,
        // Tracker was garbage collected while we waited.
        Err(_) => SeqState::TimedOut,
    };
    match state {
        SeqState::Set(version) => {
            *begin = version;
            Ok(())
        }
        SeqState::TimedOut => Err(Error::TimedOut),
        SeqState::Pending => unreachable!(),
    }
}

/// Publish this reply's cursor for sequence `seq + 1`. A retry that lands on
/// a different cursor than the first attempt cannot be reconciled and is
/// timed out, matching what its peer will conclude.
fn register_sequence_end(
    shared: &Shared,
    peer: Uid,
    seq: i32,
    end: Version,
) -> Result<()> {
    let mut trackers = shared.peek_tracker.lock().unwrap();
    let entry = trackers.entry(peer).or_default();
    entry.last_update = Instant::now();

    if let Some((&first, _)) = entry.sequences.iter().next() {
        if seq + 1 < first {
            return Err(Error::TimedOut);
        }
    }
    let slot = entry
        .sequences
        .entry(seq + 1)
        .or_insert_with(SeqSlot::new);
    match slot.get() {
        SeqState::Pending => {
            slot.set(SeqState::Set(end));
            Ok(())
        }
        SeqState::Set(existing) if existing == end => Ok(()),
        SeqState::Set(_) => {
            // A second attempt of this peek ended at a different version.
            Err(Error::TimedOut)
        }
        SeqState::TimedOut => Err(Error::TimedOut),
    }
}

/// Walk the tag's in-memory deque into `buf`, bounded by the reply budget.
/// Advances `end_version` to the cut point when the budget is hit.
fn peek_from_memory(
    shared: &Shared,
    instance: &Instance,
    tag: Tag,
    begin: Version,
    buf: &mut BytesMut,
    end_version: &mut Version,
) {
    let core = instance.core.lock().unwrap();
    let Some(td) = core.tag_data.get(&tag) else {
        return;
    };
    let begin = begin.max(core.persistent_data_durable_version + 1);
    let start = td.version_messages.partition_point(|(v, _)| *v < begin);

    let mut current_version: Option<Version> = None;
    for (version, message) in td.version_messages.iter().skip(start) {
        if current_version != Some(*version) {
            if buf.len() >= shared.config.desired_total_bytes {
                // Cut on a version boundary; everything below is complete.
                *end_version = current_version.map(|v| v + 1).unwrap_or(*end_version);
                return;
            }
            current_version = Some(*version);
            put_version_group_header(buf, *version);
        }
        buf.put_slice(message);
    }
}

/// Handle one peek request against one instance.
pub(crate) async fn handle_peek(
    shared: &Arc<Shared>,
    instance: &Arc<Instance>,
    mut req: PeekRequest,
) -> Result<PeekReply> {
    let sequence = req.sequence;
    if let Some((peer, seq)) = sequence {
        await_sequence_turn(shared, peer, seq, &mut req.begin).await?;
    }

    if req.return_if_blocked && instance.version.get() < req.begin {
        return Err(Error::EndOfStream);
    }

    if instance.version.get() < req.begin {
        instance.version.when_at_least(req.begin).await;
        sleep(shared.config.peek_delay).await;
    }

    // Log-router peeks read wide spilled spans; cap their concurrency.
    let _router_permit = if req.tag.is_log_router() {
        match shared.concurrent_log_router_reads.acquire().await {
            Ok(permit) => Some(permit),
            Err(_) => return Err(Error::Stopped),
        }
    } else {
        None
    };

    let popped_version = instance.popped_version(req.tag);
    if popped_version > req.begin {
        // The requested span is gone; tell the consumer where to restart.
        let reply = PeekReply {
            messages: Bytes::new(),
            end: popped_version,
            popped: Some(popped_version),
            max_known_version: instance.version.get(),
            min_known_committed_version: instance
                .core
                .lock()
                .unwrap()
                .min_known_committed_version,
            begin: sequence.map(|_| req.begin),
            only_spilled: false,
        };
        if let Some((peer, seq)) = sequence {
            register_sequence_end(shared, peer, seq, reply.end)?;
        }
        return Ok(reply);
    }

    let mut end_version = instance.version.get() + 1;
    let mut only_spilled = false;
    let mut messages = BytesMut::new();

    let persistent_data_durable_version = {
        let core = instance.core.lock().unwrap();
        core.persistent_data_durable_version
    };

    if req.begin <= persistent_data_durable_version {
        // Collect the in-memory continuation up front: the durable boundary
        // can advance while we read the index store.
        let mut memory = BytesMut::new();
        if req.only_spilled {
            end_version = persistent_data_durable_version + 1;
        } else {
            peek_from_memory(shared, instance, req.tag, req.begin, &mut memory, &mut end_version);
        }

        if req.tag == Tag::TXS {
            let rows = shared
                .kv
                .read_range(
                    &keys::tag_messages_key(instance.log_id, req.tag, req.begin),
                    &keys::tag_messages_key(
                        instance.log_id,
                        req.tag,
                        persistent_data_durable_version + 1,
                    ),
                    1 << 30,
                    shared.config.desired_total_bytes,
                )
                .await?;

            let mut row_bytes = 0usize;
            let mut last_version = 0;
            for (key, value) in &rows {
                let version = keys::decode_tag_key_version(keys::TAG_MESSAGES_PREFIX, key)?;
                put_version_group_header(&mut messages, version);
                messages.put_slice(value);
                row_bytes += key.len() + value.len();
                last_version = version;
            }
            if row_bytes >= shared.config.desired_total_bytes {
                end_version = last_version + 1;
                only_spilled = true;
            } else {
                messages.put_slice(&memory);
            }
        } else {
            let max_batches = shared.config.spill_reference_max_batches_per_peek;
            let rows = shared
                .kv
                .read_range(
                    &keys::tag_message_refs_key(instance.log_id, req.tag, req.begin),
                    &keys::tag_message_refs_key(
                        instance.log_id,
                        req.tag,
                        persistent_data_durable_version + 1,
                    ),
                    (max_batches + 1) as i32,
                    1 << 30,
                )
                .await?;

            let mut spilled = Vec::new();
            let mut early_end = false;
            let mut commit_bytes = 0u64;
            let mut mutation_bytes = 0usize;
            for (_, value) in rows.iter().take(max_batches) {
                for sd in keys::decode_spilled_batch(value)? {
                    if mutation_bytes >= shared.config.desired_total_bytes {
                        early_end = true;
                        break;
                    }
                    if sd.version >= req.begin {
                        commit_bytes += sd.length as u64;
                        mutation_bytes += sd.mutation_bytes as usize;
                        spilled.push(sd);
                    }
                }
                if early_end {
                    break;
                }
            }
            early_end |= rows.len() > max_batches;

            // Reserve the read bytes so a storm of spilled peeks cannot
            // balloon resident memory.
            let _memory_reservation = shared.peek_memory_limiter.take(commit_bytes).await;

            let reader = shared.queue.reader();
            let reads = spilled
                .iter()
                .map(|sd| reader.read(sd.start, sd.start + sd.length as u64));
            let records = futures::future::try_join_all(reads).await?;

            let log_router_tags = instance.core.lock().unwrap().log_router_tags;
            let mut last_version = 0;
            for record in records {
                let entry = decode_framed_entry(record)?;
                put_version_group_header(&mut messages, entry.version);
                for framed in filter_for_tag(&entry.messages, req.tag, log_router_tags)? {
                    messages.put_slice(&framed);
                }
                last_version = entry.version;
            }

            if early_end {
                end_version = last_version + 1;
                only_spilled = true;
            } else {
                messages.put_slice(&memory);
            }
        }
        trace!(
            log_id = %instance.log_id,
            tag = %req.tag,
            begin = req.begin,
            end = end_version,
            only_spilled,
            "served spilled peek"
        );
    } else if req.only_spilled {
        end_version = persistent_data_durable_version + 1;
    } else {
        peek_from_memory(shared, instance, req.tag, req.begin, &mut messages, &mut end_version);
    }

    let reply = PeekReply {
        messages: messages.freeze(),
        end: end_version,
        popped: None,
        max_known_version: instance.version.get(),
        min_known_committed_version: instance
            .core
            .lock()
            .unwrap()
            .min_known_committed_version,
        begin: sequence.map(|_| req.begin),
        only_spilled,
    };

    if let Some((peer, seq)) = sequence {
        register_sequence_end(shared, peer, seq, reply.end)?;
    }
    Ok(reply)
}

/// Garbage-collect peek trackers idle past the expiration window, timing
/// out any sequences still waiting in them.
pub(crate) async fn peek_tracker_cleanup_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let expiration = shared.config.peek_tracker_expiration;
        let mut sleep_for = expiration;
        {
            let mut trackers = shared.peek_tracker.lock().unwrap();
            trackers.retain(|peer, entry| {
                let idle = entry.last_update.elapsed();
                if idle >= expiration {
                    debug!(peer = %peer, "expiring idle peek tracker");
                    for slot in entry.sequences.values() {
                        slot.set(SeqState::TimedOut);
                    }
                    false
                } else {
                    sleep_for = sleep_for.min(expiration - idle);
                    true
                }
            });
        }
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            _ = sleep(sleep_for.max(Duration::from_millis(10))) => {}
        }
    }
}
