//! Pop Pipeline
//!
//! A pop is a consumer's acknowledgement that messages for one tag below a
//! version are no longer needed. Popping advances the tag's watermark,
//! erases eligible in-memory entries immediately, and (via the spill loop)
//! eventually drops spilled index rows and reclaims disk-queue space.
//!
//! ## The Ignore-Pop Gate
//!
//! An operator taking a filesystem-level snapshot needs the disk image
//! frozen: pops are buffered instead of applied while the gate is armed
//! (keyed by the operator's uid, with an auto-enable deadline as a
//! dead-man's switch). Buffered pops keep only the maximum `to` per tag and
//! replay in one burst when the gate opens. The txs tag bypasses the gate;
//! recovery depends on it being poppable.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taglog_core::{PopRequest, Result, Tag, Uid, Version};

use crate::instance::{Instance, RecoveryStatus};
use crate::server::Shared;

/// Process-wide pop gating state.
#[derive(Debug, Default)]
pub(crate) struct IgnorePopState {
    pub armed: bool,
    pub uid: Option<Uid>,
    pub deadline: Option<Instant>,
    /// Pops received while armed, keyed by tag, keeping the max version.
    pub to_be_popped: BTreeMap<Tag, Version>,
}

/// Apply one pop to one tag.
pub(crate) async fn pop_core(
    shared: &Arc<Shared>,
    instance: &Arc<Instance>,
    tag: Tag,
    to: Version,
) -> Result<()> {
    {
        let mut gate = shared.ignore_pops.lock().unwrap();
        if gate.armed && tag != Tag::TXS {
            let entry = gate.to_be_popped.entry(tag).or_insert(to);
            *entry = (*entry).max(to);
            debug!(tag = %tag, to, "pop buffered while gate armed");
            return Ok(());
        }
    }

    let mut recovery_ready = false;
    let erase_before = {
        let mut guard = instance.core.lock().unwrap();
        let core = &mut *guard;
        if !core.tag_data.contains_key(&tag) {
            // First contact with this tag is a pop: record the watermark so
            // later commits below it are never indexed.
            instance.create_tag_data(core, tag, to, true, true, false);
            None
        } else {
            let recovered_at = core.recovered_at;
            let durable_known_committed = core.durable_known_committed_version;
            let persistent_data_durable = core.persistent_data_durable_version;
            let td = core.tag_data.get_mut(&tag).unwrap();
            if to <= td.popped {
                None
            } else {
                td.popped = to;
                td.popped_recently = true;
                td.requires_popped_location_update = true;

                if td.unpopped_recovered && to > recovered_at {
                    td.unpopped_recovered = false;
                    core.unpopped_recovered_tags -= 1;
                    info!(
                        log_id = %instance.log_id,
                        tag = %tag,
                        remaining = core.unpopped_recovered_tags,
                        "recovered tag popped past the recovery point"
                    );
                    if core.unpopped_recovered_tags == 0
                        && durable_known_committed >= recovered_at
                    {
                        recovery_ready = true;
                    }
                }

                // Only entries already covered by the durable index are
                // erased here; anything newer is retired by the spill pass
                // that covers it.
                Some(to.min(persistent_data_durable + 1))
            }
        }
    };

    if recovery_ready && instance.recovery_status() == RecoveryStatus::Pending {
        info!(log_id = %instance.log_id, "instance recovery complete");
        instance.set_recovery_status(RecoveryStatus::Complete);
    }

    if let Some(before) = erase_before {
        let mut core = instance.core.lock().unwrap();
        Instance::erase_messages_before(
            &mut core,
            tag,
            before,
            shared.config.version_message_entry_overhead,
            &shared.bytes,
        );
    }
    Ok(())
}

/// Handle one pop request, honoring (and expiring) the ignore-pop gate.
///
/// Suspends only while cooperatively erasing in-memory entries.
pub(crate) async fn handle_pop(
    shared: &Arc<Shared>,
    instance: &Arc<Instance>,
    req: PopRequest,
) -> Result<()> {
    let replay = {
        let mut gate = shared.ignore_pops.lock().unwrap();
        if gate.armed && gate.deadline.is_some_and(|d| Instant::now() > d) {
            warn!(
                uid = ?gate.uid,
                "ignore-pop deadline lapsed; replaying buffered pops"
            );
            gate.armed = false;
            gate.uid = None;
            gate.deadline = None;
            Some(std::mem::take(&mut gate.to_be_popped))
        } else {
            None
        }
    };
    if let Some(pops) = replay {
        for (tag, to) in pops {
            debug!(tag = %tag, to, "replaying buffered pop");
            pop_core(shared, instance, tag, to).await?;
        }
    }

    pop_core(shared, instance, req.tag, req.to).await
}

/// Arm the pop gate on behalf of operator `uid`.
pub(crate) fn disable_pops(shared: &Shared, uid: Uid) {
    let mut gate = shared.ignore_pops.lock().unwrap();
    if gate.armed {
        if let Some(owner) = gate.uid {
            if owner != uid {
                warn!(owner = %owner, caller = %uid, "pop gate re-armed by a different uid");
            }
        }
    }
    gate.armed = true;
    gate.uid = Some(uid);
    gate.deadline = Some(Instant::now() + shared.config.ignore_pop_auto_enable_delay);
    info!(uid = %uid, "pop gate armed");
}

/// Disarm the pop gate and replay everything buffered behind it.
pub(crate) async fn enable_pops(
    shared: &Arc<Shared>,
    instance: &Arc<Instance>,
    uid: Uid,
) -> Result<()> {
    let pops = {
        let mut gate = shared.ignore_pops.lock().unwrap();
        if gate.uid.is_some() && gate.uid != Some(uid) {
            warn!(owner = ?gate.uid, caller = %uid, "pop gate disarmed by a different uid");
        }
        gate.armed = false;
        gate.uid = None;
        gate.deadline = None;
        std::mem::take(&mut gate.to_be_popped)
    };
    for (tag, to) in pops {
        debug!(tag = %tag, to, "replaying buffered pop");
        pop_core(shared, instance, tag, to).await?;
    }
    info!(uid = %uid, "pop gate disarmed");
    Ok(())
}
