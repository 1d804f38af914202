//! Spill Engine
//!
//! Moves the oldest in-memory messages into the durable index store so the
//! in-memory window stays bounded. Runs as a background loop at lower
//! priority than client-facing work.
//!
//! ## Two Spill Strategies
//!
//! - **By value** (the system-transaction tag only): the full message bytes
//!   go into one index row per version. The txs stream is small and peeked
//!   during recovery, so paying the write amplification buys fast reads.
//! - **By reference** (every other tag): the index row stores
//!   `{version, queue location, length, mutation bytes}` pointers back into
//!   the disk queue. Up to a batch-size cap of pointers pack into one row,
//!   keyed by the last version in the batch.
//!
//! ## One Spill Pass
//!
//! 1. Pick `next_version`: the furthest version whose cumulative bytes since
//!    the last spill fit the per-pass budget.
//! 2. Wait until the disk queue is durable through `next_version` (never
//!    index data that could vanish in a crash).
//! 3. For every tag, write the rows; record the minimum queue location still
//!    referenced.
//! 4. Transactionally persist `version/`, `knownCommitted/`, and the
//!    recovery location, then commit the index store.
//! 5. Erase the spilled span from memory and advance the durable watermark.
//! 6. Re-index stale popped locations and pop the disk queue up to the
//!    minimum location any live tag still needs.
//!
//! Spilling and popping share `persistent_data_commit_lock`; a pop never
//! crosses the spill batch it belongs to.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, trace};

use bytes::{BufMut, BytesMut};
use taglog_core::{Result, Tag, Version};

use crate::instance::{Instance, InstanceCore};
use crate::keys::{self, SpilledData, SPILLED_DATA_ENCODED_LEN};
use crate::server::Shared;

/// Persist a freshly advanced popped watermark and drop index rows the
/// consumer no longer needs. Runs inside a spill pass, before new rows for
/// the tag are written.
pub(crate) fn update_persistent_popped(
    shared: &Shared,
    instance: &Instance,
    core: &mut InstanceCore,
    tag: Tag,
) {
    let persistent_data_version = core.persistent_data_version;
    let Some(td) = core.tag_data.get_mut(&tag) else {
        return;
    };
    if !td.popped_recently {
        return;
    }
    shared.kv.set(
        &keys::tag_popped_key(instance.log_id, tag),
        &keys::encode_version_value(td.popped),
    );
    td.popped_recently = false;

    if td.nothing_persistent {
        return;
    }

    if tag == Tag::TXS {
        shared.kv.clear_range(
            &keys::tag_messages_key(instance.log_id, tag, 0),
            &keys::tag_messages_key(instance.log_id, tag, td.popped),
        );
    } else {
        shared.kv.clear_range(
            &keys::tag_message_refs_key(instance.log_id, tag, 0),
            &keys::tag_message_refs_key(instance.log_id, tag, td.popped),
        );
    }

    if td.popped > persistent_data_version {
        td.nothing_persistent = true;
    }
}

/// Re-derive a tag's `popped_location` after its popped version moved.
///
/// The next needed location is found in the spilled index if the tag still
/// has rows there, otherwise in the in-memory version map. An instance with
/// data in neither place is about to be removed; its location is left
/// frozen rather than guessed.
pub(crate) async fn update_popped_location(
    shared: &Shared,
    instance: &Instance,
    tag: Tag,
) -> Result<()> {
    // txs is spilled by value; its rows carry no queue locations to track.
    if tag == Tag::TXS {
        return Ok(());
    }

    let (popped, persistent_data_version) = {
        let mut core = instance.core.lock().unwrap();
        let pdv = core.persistent_data_version;
        let Some(td) = core.tag_data.get_mut(&tag) else {
            return Ok(());
        };
        if !td.requires_popped_location_update {
            return Ok(());
        }
        td.requires_popped_location_update = false;
        (td.popped, pdv)
    };

    if popped <= persistent_data_version {
        let rows = shared
            .kv
            .read_range(
                &keys::tag_message_refs_key(instance.log_id, tag, popped),
                &keys::tag_message_refs_key(instance.log_id, tag, persistent_data_version + 1),
                1,
                1 << 30,
            )
            .await?;

        let mut core = instance.core.lock().unwrap();
        if let Some(td) = core.tag_data.get_mut(&tag) {
            match rows.first() {
                None => {
                    // Nothing was persistent after all.
                    td.nothing_persistent = true;
                }
                Some((_, value)) => {
                    for sd in keys::decode_spilled_batch(value)? {
                        if sd.version >= td.popped {
                            td.popped_location = sd.start;
                            break;
                        }
                    }
                }
            }
        }
    }

    let mut core = instance.core.lock().unwrap();
    let pdv = core.persistent_data_version;
    let location = Instance::location_at_or_after(&core, popped);
    if let Some(td) = core.tag_data.get_mut(&tag) {
        if td.popped >= pdv || td.nothing_persistent {
            match location {
                Some((_, start)) => td.popped_location = start,
                None => {
                    // No data on disk and none in memory: the instance is on
                    // its way out, so leave the location frozen instead of
                    // advancing past an unknown point.
                }
            }
        }
    }
    Ok(())
}

/// Advance the raw queue's reclaimable prefix to the minimum location any
/// live tag (or unspilled data) still needs.
pub(crate) async fn pop_disk_queue(shared: &Shared, instance: &Arc<Instance>) -> Result<()> {
    if !instance.core.lock().unwrap().initialized {
        return Ok(());
    }

    let tags: Vec<Tag> = {
        let core = instance.core.lock().unwrap();
        core.tag_data.keys().copied().collect()
    };
    for tag in tags {
        update_popped_location(shared, instance, tag).await?;
    }

    let (mut min_location, mut min_version) = {
        let core = instance.core.lock().unwrap();
        let (mut min_location, mut min_version) =
            match Instance::location_at_or_after(&core, core.persistent_data_version) {
                Some((v, start)) => (start, v),
                None => (0, 0),
            };
        for td in core.tag_data.values() {
            if td.tag != Tag::TXS && !td.nothing_persistent {
                min_location = min_location.min(td.popped_location);
                min_version = min_version.min(td.popped);
            }
        }
        (min_location, min_version)
    };

    if shared.queue_commit_end.get() > 0 {
        let last_committed = instance.queue_committed_version.get();
        let last_committed_location = {
            let core = instance.core.lock().unwrap();
            Instance::location_at_or_after(&core, last_committed)
                .map(|(_, start)| start)
                .unwrap_or(min_location)
        };
        min_location = min_location.min(last_committed_location);
        shared.queue.pop(min_location);

        let mut core = instance.core.lock().unwrap();
        if min_version > core.queue_popped_version {
            core.queue_popped_version = min_version;
        }
        trace!(
            log_id = %instance.log_id,
            min_location,
            min_version,
            "disk queue popped"
        );
    }
    let _ = min_version;
    Ok(())
}

/// Spill one tag's messages at versions `<= new_version` into the index
/// store. Returns true if any row was written.
fn spill_tag(
    shared: &Shared,
    instance: &Instance,
    core: &mut InstanceCore,
    tag: Tag,
    new_version: Version,
) -> Result<bool> {
    let max_batch = shared.config.spill_reference_max_bytes_per_batch;
    let InstanceCore {
        tag_data,
        version_location,
        ..
    } = core;
    let Some(td) = tag_data.get_mut(&tag) else {
        return Ok(false);
    };

    let mut any_data = false;
    let mut idx = 0usize;

    if tag == Tag::TXS {
        // Spill by value: one row per version holding the raw messages.
        while idx < td.version_messages.len() {
            let version = td.version_messages[idx].0;
            if version > new_version {
                break;
            }
            let mut value = BytesMut::new();
            while idx < td.version_messages.len() && td.version_messages[idx].0 == version {
                value.put_slice(&td.version_messages[idx].1);
                idx += 1;
            }
            shared.kv.set(
                &keys::tag_messages_key(instance.log_id, tag, version),
                &value,
            );
            any_data = true;
            td.nothing_persistent = false;
        }
        return Ok(any_data);
    }

    // Spill by reference: pack pointers into rows capped at max_batch bytes.
    let mut batch: Vec<SpilledData> = Vec::new();
    let mut batch_bytes = 4usize;
    let mut last_version = Version::MIN;
    let mut first_location = u64::MAX;

    let flush = |batch: &mut Vec<SpilledData>,
                     last_version: Version,
                     first_location: u64,
                     td_popped_location: &mut u64|
     -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut value = BytesMut::with_capacity(4 + batch.len() * SPILLED_DATA_ENCODED_LEN);
        value.put_u32_le(batch.len() as u32);
        for sd in batch.iter() {
            sd.encode(&mut value);
        }
        shared.kv.set(
            &keys::tag_message_refs_key(instance.log_id, tag, last_version),
            &value,
        );
        *td_popped_location = (*td_popped_location).min(first_location);
        batch.clear();
        Ok(())
    };

    while idx < td.version_messages.len() {
        let version = td.version_messages[idx].0;
        if version > new_version {
            break;
        }
        any_data = true;
        td.nothing_persistent = false;

        let Some(&(start, end)) = version_location.get(&version) else {
            return Err(taglog_core::Error::CorruptRecord(format!(
                "no queue location for spilled version {version}"
            )));
        };
        let length = (end - start) as u32;

        let mut mutation_bytes = 0u32;
        while idx < td.version_messages.len() && td.version_messages[idx].0 == version {
            mutation_bytes += td.version_messages[idx].1.len() as u32 - 4;
            idx += 1;
        }

        batch.push(SpilledData {
            version,
            start,
            length,
            mutation_bytes,
        });
        batch_bytes += SPILLED_DATA_ENCODED_LEN;
        last_version = last_version.max(version);
        first_location = first_location.min(start);

        if batch_bytes + SPILLED_DATA_ENCODED_LEN > max_batch {
            flush(&mut batch, last_version, first_location, &mut td.popped_location)?;
            batch_bytes = 4;
        }
    }
    flush(&mut batch, last_version, first_location, &mut td.popped_location)?;
    Ok(any_data)
}

/// Move everything at versions `<= new_version` into the index store and
/// commit it, then erase the spilled span from memory.
pub(crate) async fn update_persistent_data(
    shared: &Shared,
    instance: &Arc<Instance>,
    new_version: Version,
) -> Result<()> {
    let mut any_data = false;
    {
        let mut core = instance.core.lock().unwrap();
        debug_assert!(new_version <= instance.version.get());
        debug_assert!(new_version <= instance.queue_committed_version.get());
        debug_assert!(new_version > core.persistent_data_version);
        debug_assert!(core.persistent_data_version == core.persistent_data_durable_version);

        let tags: Vec<Tag> = core.tag_data.keys().copied().collect();
        for tag in tags {
            let popped = core.tag_data[&tag].popped;
            Instance::erase_messages_before(
                &mut core,
                tag,
                popped,
                shared.config.version_message_entry_overhead,
                &shared.bytes,
            );
            update_persistent_popped(shared, instance, &mut core, tag);
            any_data |= spill_tag(shared, instance, &mut core, tag, new_version)?;
        }

        if let Some((_, start)) = Instance::location_at_or_after(&core, new_version) {
            shared
                .kv
                .set(keys::RECOVERY_LOCATION_KEY, &keys::encode_location_value(start));
        }
        shared.kv.set(
            &keys::per_instance_key(keys::CURRENT_VERSION_PREFIX, instance.log_id),
            &keys::encode_version_value(new_version),
        );
        shared.kv.set(
            &keys::per_instance_key(keys::KNOWN_COMMITTED_PREFIX, instance.log_id),
            &keys::encode_version_value(core.known_committed_version),
        );
        core.persistent_data_version = new_version;
    }

    shared.kv.commit().await?;

    // The index rows are durable; now the memory they cover can go.
    let mut core = instance.core.lock().unwrap();
    core.persistent_data_durable_version = new_version;
    if any_data {
        debug!(
            log_id = %instance.log_id,
            new_version,
            "spilled data now durable"
        );
    }

    let tags: Vec<Tag> = core.tag_data.keys().copied().collect();
    for tag in tags {
        Instance::erase_messages_before(
            &mut core,
            tag,
            new_version + 1,
            shared.config.version_message_entry_overhead,
            &shared.bytes,
        );
    }

    let durable_floor = core.persistent_data_durable_version;
    let doomed: Vec<Version> = core
        .version_sizes
        .range(..durable_floor)
        .map(|(&v, _)| v)
        .collect();
    for v in doomed {
        core.version_sizes.remove(&v);
    }

    while let Some((block_version, block)) = core.message_blocks.front() {
        if *block_version > new_version {
            break;
        }
        let bytes_erased = (block.len() as f64 * shared.config.block_overhead_factor) as i64;
        core.bytes_durable += bytes_erased;
        shared.bytes.bytes_durable.fetch_add(bytes_erased, Ordering::Relaxed);
        core.message_blocks.pop_front();
    }

    if core.bytes_durable > core.bytes_input
        || shared.bytes.durable() > shared.bytes.input()
    {
        error!(
            log_id = %instance.log_id,
            local_input = core.bytes_input,
            local_durable = core.bytes_durable,
            shared_input = shared.bytes.input(),
            shared_durable = shared.bytes.durable(),
            "durable bytes exceed input bytes"
        );
        debug_assert!(false, "bytes_durable > bytes_input");
    }

    if shared.queue_commit_end.get() > 0 {
        Instance::forget_version_locations_before(&mut core, new_version);
    }
    Ok(())
}

fn choose_next_version_stopped(
    core: &InstanceCore,
    version_now: Version,
    byte_limit: i64,
) -> (Version, i64) {
    let mut total = 0i64;
    let mut next = version_now;
    let mut it = core.version_sizes.iter().peekable();
    while total < byte_limit {
        let Some((_, &(bytes, txs_bytes))) = it.next() else {
            break;
        };
        total += bytes + txs_bytes;
        next = it.peek().map(|e| *e.0).unwrap_or(version_now);
    }
    (next, total)
}

fn choose_next_version_running(
    core: &InstanceCore,
    version_now: Version,
    byte_limit: i64,
    spill_threshold: i64,
) -> (Version, i64) {
    if core.version_sizes.is_empty() {
        return (version_now, 0);
    }
    let mut total = 0i64;
    // Stays 0 (spilling nothing) unless memory actually needs relief.
    let mut next = 0;
    let mut it = core.version_sizes.iter().peekable();
    while total < byte_limit {
        let Some((_, &(bytes, txs_bytes))) = it.next() else {
            break;
        };
        // Keep spilling only while memory still needs relief, except that
        // fully erased versions are always cheap to retire.
        if !(core.bytes_input - core.bytes_durable - total >= spill_threshold || bytes == 0) {
            break;
        }
        total += bytes + txs_bytes;
        next = it.peek().map(|e| *e.0).unwrap_or(version_now);
    }
    (next, total)
}

/// One pass of the spill loop over the oldest instance with data in memory.
pub(crate) async fn update_storage(shared: &Arc<Shared>) -> Result<()> {
    let interval = shared.config.storage_min_update_interval;
    let Some(instance) = shared.front_of_spill_order() else {
        sleep(interval).await;
        return Ok(());
    };

    if instance.is_stopped() {
        if shared.bytes.window() < shared.config.spill_threshold {
            sleep(interval).await;
            return Ok(());
        }
        // Drain the stopped instance completely so it can be retired.
        while instance.core.lock().unwrap().persistent_data_durable_version
            != instance.version.get()
        {
            let (next_version, _total) = {
                let core = instance.core.lock().unwrap();
                choose_next_version_stopped(
                    &core,
                    instance.version.get(),
                    shared.config.reference_spill_update_storage_byte_limit,
                )
            };
            instance.queue_committed_version.when_at_least(next_version).await;

            let persistent_data_version =
                instance.core.lock().unwrap().persistent_data_version;
            if next_version > persistent_data_version {
                let _commit_guard = shared.persistent_data_commit_lock.lock().await;
                update_persistent_data(shared, &instance, next_version).await?;
                if let Some(pop_instance) = shared.front_of_pop_order() {
                    pop_disk_queue(shared, &pop_instance).await?;
                }
            } else {
                sleep(interval).await;
            }

            if instance.is_removed() {
                break;
            }
        }

        if instance.core.lock().unwrap().persistent_data_durable_version
            == instance.version.get()
        {
            info!(log_id = %instance.log_id, "stopped instance fully spilled");
            shared.retire_from_spill_order(instance.log_id);
        }
        return Ok(());
    }

    if instance.core.lock().unwrap().initialized {
        let (next_version, total) = {
            let core = instance.core.lock().unwrap();
            choose_next_version_running(
                &core,
                instance.version.get(),
                shared.config.reference_spill_update_storage_byte_limit,
                shared.config.spill_threshold,
            )
        };

        instance.queue_committed_version.when_at_least(next_version).await;

        let persistent_data_version = instance.core.lock().unwrap().persistent_data_version;
        if next_version > persistent_data_version {
            let _commit_guard = shared.persistent_data_commit_lock.lock().await;
            update_persistent_data(shared, &instance, next_version).await?;
            if let Some(pop_instance) = shared.front_of_pop_order() {
                pop_disk_queue(shared, &pop_instance).await?;
            }
        }

        if total < shared.config.update_storage_byte_limit {
            sleep(interval).await;
        } else {
            // Stay hot while there is a backlog, but let client work in.
            tokio::task::yield_now().await;
        }
    } else {
        sleep(interval).await;
    }
    Ok(())
}

/// The background spill loop; exits on shutdown or a fatal storage error.
pub(crate) async fn update_storage_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            result = update_storage(&shared) => {
                if let Err(e) = result {
                    error!(error = %e, "spill pass failed; storage loop halted");
                    return;
                }
            }
        }
    }
}
