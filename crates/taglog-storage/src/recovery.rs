//! Startup Recovery
//!
//! Rebuilds the process state after a restart, in two phases:
//!
//! 1. **Index store**: read the format key (absent means fresh install;
//!    unknown means fatal), then every per-instance range. Each persisted
//!    log id becomes a stopped [`Instance`] whose watermarks equal its
//!    stored persistent-data version, with popped tags restored so no
//!    consumer can be served data it already acknowledged.
//! 2. **Log queue replay**: from the persisted recovery location, route
//!    every entry newer than its instance's stored version back into
//!    memory. Entries at or below the stored version are safe duplicates
//!    (the recovery location and the version key are committed together,
//!    so replay can overlap the spilled span but never miss data). If the
//!    un-durable window grows past the recovery memory limit mid-replay,
//!    the spill loop runs inline before replay continues.
//!
//! After replay every restored instance is serviceable for peeks and locks;
//! none accept commits (their generation is over), and their
//! `recovery_finished` never resolves.

use std::sync::Arc;
use tracing::{debug, info, warn};

use taglog_core::message::parse_messages;
use taglog_core::{Error, Result, Uid, Version};

use crate::instance::{Instance, RecoveryStatus};
use crate::keys;
use crate::server::Shared;
use crate::spill;

/// Read every value in `[prefix, strinc(prefix))`, decoding the uid suffix
/// of each key.
async fn read_instance_range(
    shared: &Shared,
    prefix: &[u8],
) -> Result<Vec<(Uid, bytes::Bytes)>> {
    let (begin, end) = keys::prefix_range(prefix);
    let rows = shared.kv.read_range(&begin, &end, 1 << 30, 1 << 30).await?;
    let mut out = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        out.push((keys::decode_instance_id(prefix, &key)?, value));
    }
    Ok(out)
}

/// Restore all durable state; called once by `TLogServer::open`.
pub(crate) async fn restore(shared: &Arc<Shared>) -> Result<()> {
    let format = shared.kv.read_value(keys::FORMAT_KEY).await?;
    let Some(format) = format else {
        // No format key: this must be a truly empty store, never a partial
        // one.
        let probe = shared.kv.read_range(b"", &[0xffu8][..], 1, 1 << 20).await?;
        if !probe.is_empty() {
            return Err(Error::UnsupportedFormat(
                "index store has data but no format key".into(),
            ));
        }
        if !shared.queue.initialize_recovery(0) && shared.queue.read_next().await?.is_some() {
            return Err(Error::RecruitmentFailed(
                "disk queue has records but the index store is empty".into(),
            ));
        }
        info!(dbgid = %shared.dbgid, "fresh install; nothing to recover");
        return Ok(());
    };

    if format.as_ref() < keys::FORMAT_READABLE_BEGIN || format.as_ref() >= keys::FORMAT_READABLE_END
    {
        return Err(Error::UnsupportedFormat(
            String::from_utf8_lossy(&format).into_owned(),
        ));
    }

    let recovery_location = match shared.kv.read_value(keys::RECOVERY_LOCATION_KEY).await? {
        Some(value) => keys::decode_location_value(&value)?,
        None => 0,
    };

    let versions = read_instance_range(shared, keys::CURRENT_VERSION_PREFIX).await?;
    let known_committed = read_instance_range(shared, keys::KNOWN_COMMITTED_PREFIX).await?;
    let localities = read_instance_range(shared, keys::LOCALITY_PREFIX).await?;
    let router_tags = read_instance_range(shared, keys::LOG_ROUTER_TAGS_PREFIX).await?;
    let recovery_counts = read_instance_range(shared, keys::RECOVERY_COUNT_PREFIX).await?;
    let protocol_versions = read_instance_range(shared, keys::PROTOCOL_VERSION_PREFIX).await?;

    if versions.len() != recovery_counts.len() {
        return Err(Error::CorruptRecord(
            "per-instance key ranges disagree on instance count".into(),
        ));
    }

    let lookup = |rows: &[(Uid, bytes::Bytes)], id: Uid| -> Option<bytes::Bytes> {
        rows.iter()
            .find(|(row_id, _)| *row_id == id)
            .map(|(_, v)| v.clone())
    };

    let mut logs_by_version: Vec<(Version, Uid)> = Vec::new();
    for (id, version_value) in &versions {
        let id = *id;
        let stored_version = keys::decode_version_value(version_value)?;
        let locality = lookup(&localities, id)
            .map(|v| keys::decode_i8_value(&v))
            .transpose()?
            .unwrap_or(taglog_core::tag::LOCALITY_INVALID);
        let log_router_tags = lookup(&router_tags, id)
            .map(|v| keys::decode_i32_value(&v))
            .transpose()?
            .unwrap_or(0);
        let recovery_count = lookup(&recovery_counts, id)
            .map(|v| keys::decode_u64_value(&v))
            .transpose()?
            .unwrap_or(0);
        let protocol_version = lookup(&protocol_versions, id)
            .map(|v| keys::decode_u64_value(&v))
            .transpose()?
            .unwrap_or(taglog_core::PROTOCOL_VERSION);

        let instance = Arc::new(Instance::new(
            id,
            Uid::default(),
            recovery_count,
            protocol_version,
            true,
            locality,
            log_router_tags,
            Vec::new(),
        ));
        instance.set_stopped();
        {
            let mut core = instance.core.lock().unwrap();
            core.known_committed_version = lookup(&known_committed, id)
                .map(|v| keys::decode_version_value(&v))
                .transpose()?
                .unwrap_or(0);
            core.persistent_data_version = stored_version;
            core.persistent_data_durable_version = stored_version;
        }
        instance.version.set(stored_version);

        // Restore popped tags. Pops later than the last spill commit are
        // lost, which is fine: the corresponding data comes back too.
        let popped_rows = shared
            .kv
            .read_range(
                &keys::per_instance_key(keys::TAG_POPPED_PREFIX, id),
                &keys::per_instance_key_end(keys::TAG_POPPED_PREFIX, id),
                1 << 30,
                1 << 30,
            )
            .await?;
        {
            let mut core = instance.core.lock().unwrap();
            for (key, value) in popped_rows {
                let tag = keys::decode_tag_popped_key(&key)?;
                let popped = keys::decode_version_value(&value)?;
                debug!(log_id = %id, tag = %tag, popped, "restored popped tag");
                instance.create_tag_data(&mut core, tag, popped, false, false, false);
            }
        }

        info!(
            log_id = %id,
            version = stored_version,
            "instance restored from index store"
        );
        shared.instances.lock().unwrap().insert(id, instance);
        logs_by_version.push((stored_version, id));
    }

    // Fully spilled instances never show up in queue replay; pop order
    // still needs them, oldest generation first.
    logs_by_version.sort();
    {
        let mut pop_order = shared.pop_order.lock().unwrap();
        for (_, id) in &logs_by_version {
            pop_order.push_back(*id);
        }
    }

    replay_queue(shared, recovery_location).await?;

    for instance in shared.instances.lock().unwrap().values() {
        if instance.queue_committed_version.get() == 0 {
            // No queue entry survived for this instance; its durable state
            // is the whole story.
            instance
                .queue_committed_version
                .set(instance.version.get());
        }
        instance.set_recovery_status(RecoveryStatus::Failed);
    }

    info!(
        dbgid = %shared.dbgid,
        instances = shared.instances.lock().unwrap().len(),
        "restore complete"
    );
    Ok(())
}

/// Replay the framed log queue from `recovery_location`.
async fn replay_queue(shared: &Arc<Shared>, recovery_location: u64) -> Result<()> {
    if shared.queue.initialize_recovery(recovery_location) {
        return Ok(());
    }

    let mut replayed = 0u64;
    let mut last_id: Option<Uid> = None;
    let mut current: Option<Arc<Instance>> = None;

    while let Some((entry, start, end)) = shared.queue.read_next().await? {
        if last_id != Some(entry.id) {
            last_id = Some(entry.id);
            current = shared.instance(entry.id);
            if current.is_none() {
                warn!(log_id = %entry.id, "queue entry for an unknown instance; skipped");
            }
        }
        let Some(instance) = current.as_ref() else {
            continue;
        };

        {
            let mut spill_order = shared.spill_order.lock().unwrap();
            if spill_order.back() != Some(&entry.id) {
                spill_order.push_back(entry.id);
            }
        }

        {
            let mut core = instance.core.lock().unwrap();
            core.known_committed_version = core
                .known_committed_version
                .max(entry.known_committed_version);
            core.version_location.insert(entry.version, (start, end));
        }

        if entry.version > instance.version.get() {
            let messages = parse_messages(&entry.messages)?;
            {
                let mut core = instance.core.lock().unwrap();
                instance.commit_messages(
                    &mut core,
                    entry.version,
                    &messages,
                    &shared.config,
                    &shared.bytes,
                );
            }
            instance.version.set(entry.version);
            instance.queue_committed_version.set(entry.version);
            replayed += 1;

            // Replay can outpace spilling badly on a large queue; shed
            // memory before reading further.
            while shared.bytes.window() >= shared.config.recover_memory_limit {
                info!(
                    log_id = %entry.id,
                    bytes_input = shared.bytes.input(),
                    bytes_durable = shared.bytes.durable(),
                    "flushing oversized queue during recovery"
                );
                spill::update_storage(shared).await?;
            }
        } else {
            // Covered by the spilled span already; the transactional write
            // of the recovery location and version key guarantees this is a
            // duplicate, not a divergence.
            debug_assert!(entry.version <= instance.version.get());
        }
    }

    info!(replayed, "queue replay complete");
    Ok(())
}
