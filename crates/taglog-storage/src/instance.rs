//! Per-Instance Log State
//!
//! One [`Instance`] is one log generation: recruited at an epoch, fed by
//! commits, drained by peeks and pops, eventually stopped and fully spilled
//! when a newer generation takes over. Several instances can coexist in one
//! process (across epochs), sharing the disk queue and index store.
//!
//! ## What Lives Here
//!
//! - **Per-tag index**: for each tag, a deque of `(version, message)` slices
//!   plus the popped watermark and spill bookkeeping ([`TagData`])
//! - **Message blocks**: refcounted buffers backing those slices, keyed by
//!   version so whole blocks drop once spilled
//! - **Version maps**: per-version byte sums (for spill batch sizing) and
//!   per-version queue locations (for spill-by-reference)
//! - **Watermarks**: the version lattice
//!   (`known_committed <= version`, `persistent_data_durable <=
//!   persistent_data <= queue_committed <= version`)
//!
//! ## Locking
//!
//! All mutable state sits in [`InstanceCore`] under a std `Mutex`; it is
//! only ever held for synchronous sections, never across awaits. The
//! awaited things (`version`, `queue_committed_version`, stop signals) are
//! watch channels next to the mutex.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::warn;

use taglog_core::tag::{LOCALITY_LOG_ROUTER, LOCALITY_SATELLITE, LOCALITY_SPECIAL};
use taglog_core::{Tag, TaggedMessage, Uid, Version};

use crate::config::TLogConfig;
use crate::disk_queue::Location;
use crate::watch::{Trigger, VersionWatch};

/// Shared (process-wide) byte accounting across all instances.
#[derive(Debug, Default)]
pub struct SharedBytes {
    pub bytes_input: AtomicI64,
    pub bytes_durable: AtomicI64,
    pub overhead_bytes_input: AtomicI64,
    pub overhead_bytes_durable: AtomicI64,
}

impl SharedBytes {
    pub fn input(&self) -> i64 {
        self.bytes_input.load(Ordering::Relaxed)
    }

    pub fn durable(&self) -> i64 {
        self.bytes_durable.load(Ordering::Relaxed)
    }

    /// The un-durable window driving spill and backpressure decisions.
    pub fn window(&self) -> i64 {
        self.input() - self.durable()
    }
}

/// Per-tag index state.
///
/// Popped version contract: `popped` only ever increases, no message with
/// version below it is returned to any peek, and it is persisted atomically
/// with erasing spilled rows so recovery cannot resurrect popped data.
#[derive(Debug)]
pub struct TagData {
    pub tag: Tag,
    /// `(version, framed message)` in version order; slices into blocks.
    pub version_messages: VecDeque<(Version, Bytes)>,
    pub popped: Version,
    /// Earliest disk-queue location still needed by this tag.
    pub popped_location: Location,
    /// True means the tag is *known* to have no rows in the index store.
    pub nothing_persistent: bool,
    /// `popped` changed since the last spill pass persisted it.
    pub popped_recently: bool,
    /// `popped` changed since the last popped-location re-index.
    pub requires_popped_location_update: bool,
    /// Tag still holds recovered data the new generation has not popped.
    pub unpopped_recovered: bool,
}

impl TagData {
    fn new(
        tag: Tag,
        popped: Version,
        nothing_persistent: bool,
        popped_recently: bool,
        unpopped_recovered: bool,
    ) -> Self {
        TagData {
            tag,
            version_messages: VecDeque::new(),
            popped,
            popped_location: 0,
            nothing_persistent,
            popped_recently,
            requires_popped_location_update: false,
            unpopped_recovered,
        }
    }
}

/// Recovery lifecycle of an instance, observable by `recovery_finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Pending,
    Complete,
    /// The instance was stopped or displaced before recovery completed.
    Failed,
}

/// Mutable state of one instance, under the instance mutex.
#[derive(Debug)]
pub struct InstanceCore {
    pub locality: i8,
    pub log_router_tags: i32,

    pub tag_data: BTreeMap<Tag, TagData>,
    /// Refcounted buffers backing the index slices, keyed by version.
    pub message_blocks: VecDeque<(Version, Bytes)>,
    /// Per-version `(bytes, txs_bytes)` sums for spill batch sizing.
    pub version_sizes: BTreeMap<Version, (i64, i64)>,
    /// `[start, end)` disk-queue locations of each pushed version.
    pub version_location: BTreeMap<Version, (Location, Location)>,

    pub known_committed_version: Version,
    pub durable_known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub persistent_data_version: Version,
    pub persistent_data_durable_version: Version,
    pub queue_committing_version: Version,
    pub queue_popped_version: Version,
    pub unrecovered_before: Version,
    pub recovered_at: Version,

    pub unpopped_recovered_tags: usize,
    pub bytes_input: i64,
    pub bytes_durable: i64,
    pub initialized: bool,
}

/// One log generation hosted by this process.
pub struct Instance {
    pub log_id: Uid,
    pub recruitment_id: Uid,
    pub recovery_count: u64,
    pub protocol_version: u64,
    pub is_primary: bool,
    /// Tags known at recruitment; pops of other tags past `recovered_at`
    /// start beyond the recovered span.
    pub all_tags: BTreeSet<Tag>,

    /// Highest accepted version; publication point for peeks and the queue
    /// commit worker.
    pub version: VersionWatch,
    /// Highest version durable on the disk queue.
    pub queue_committed_version: VersionWatch,

    stopped: watch::Sender<bool>,
    /// Fires when a new generation displaces this one mid-commit.
    pub stop_commit: Trigger,
    pub recovery_status: watch::Sender<RecoveryStatus>,
    /// Fires on teardown; background work holding this instance exits.
    pub removed: watch::Sender<bool>,
    /// Serializes an exec-tagged commit with ordinary ones.
    pub exec_op_lock: tokio::sync::Mutex<()>,
    /// An exec-tagged commit holds the lock between version publication and
    /// queue durability; ordinary commits must queue behind it.
    pub exec_op_in_progress: std::sync::atomic::AtomicBool,
    /// Set once the queue-commit worker has adopted this instance.
    pub committing_adopted: watch::Sender<bool>,

    pub core: Mutex<InstanceCore>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_id: Uid,
        recruitment_id: Uid,
        recovery_count: u64,
        protocol_version: u64,
        is_primary: bool,
        locality: i8,
        log_router_tags: i32,
        all_tags: Vec<Tag>,
    ) -> Self {
        Instance {
            log_id,
            recruitment_id,
            recovery_count,
            protocol_version,
            is_primary,
            all_tags: all_tags.into_iter().collect(),
            version: VersionWatch::new(0),
            queue_committed_version: VersionWatch::new(0),
            stopped: watch::channel(false).0,
            stop_commit: Trigger::new(),
            recovery_status: watch::channel(RecoveryStatus::Pending).0,
            removed: watch::channel(false).0,
            exec_op_lock: tokio::sync::Mutex::new(()),
            exec_op_in_progress: std::sync::atomic::AtomicBool::new(false),
            committing_adopted: watch::channel(false).0,
            core: Mutex::new(InstanceCore {
                locality,
                log_router_tags,
                tag_data: BTreeMap::new(),
                message_blocks: VecDeque::new(),
                version_sizes: BTreeMap::new(),
                version_location: BTreeMap::new(),
                known_committed_version: 0,
                durable_known_committed_version: 0,
                min_known_committed_version: 0,
                persistent_data_version: 0,
                persistent_data_durable_version: 0,
                queue_committing_version: 0,
                queue_popped_version: 0,
                unrecovered_before: 1,
                recovered_at: 1,
                unpopped_recovered_tags: 0,
                bytes_input: 0,
                bytes_durable: 0,
                initialized: false,
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn set_stopped(&self) {
        self.stopped.send_replace(true);
    }

    pub async fn when_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.borrow()
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        *self.recovery_status.borrow()
    }

    /// Mark recovery complete/failed; the first outcome wins.
    pub fn set_recovery_status(&self, status: RecoveryStatus) {
        self.recovery_status.send_if_modified(|cur| {
            if *cur == RecoveryStatus::Pending {
                *cur = status;
                true
            } else {
                false
            }
        });
    }

    /// The popped version a peek at `tag` must respect; tags never written
    /// report the recovered-at watermark.
    pub fn popped_version(&self, tag: Tag) -> Version {
        let core = self.core.lock().unwrap();
        match core.tag_data.get(&tag) {
            Some(td) => td.popped,
            None => core.recovered_at,
        }
    }

    /// Create the per-tag entry. For a tag the recruitment did not announce,
    /// recovered data was never transferred, so its popped floor starts past
    /// the recovered span.
    pub fn create_tag_data<'a>(
        &self,
        core: &'a mut InstanceCore,
        tag: Tag,
        mut popped: Version,
        nothing_persistent: bool,
        popped_recently: bool,
        unpopped_recovered: bool,
    ) -> &'a mut TagData {
        if tag.locality != LOCALITY_LOG_ROUTER
            && !self.all_tags.is_empty()
            && !self.all_tags.contains(&tag)
            && popped <= core.recovered_at
        {
            popped = core.recovered_at + 1;
        }
        core.tag_data.entry(tag).or_insert_with(|| {
            TagData::new(
                tag,
                popped,
                nothing_persistent,
                popped_recently,
                unpopped_recovered,
            )
        })
    }

    /// Route one version's messages into the per-tag index and blocks.
    ///
    /// Filters tags by locality: a satellite instance stores only txs and
    /// log-router tags; any other instance stores tags whose locality
    /// matches its own or is negative. Log-router ids are reduced modulo the
    /// configured router count. Messages at versions at or below a tag's
    /// popped watermark are not indexed.
    pub fn commit_messages(
        &self,
        core: &mut InstanceCore,
        version: Version,
        messages: &[TaggedMessage],
        config: &TLogConfig,
        shared: &SharedBytes,
    ) {
        if messages.is_empty() {
            return;
        }

        let total: usize = messages.iter().map(|m| m.framed.len()).sum();
        let mut block = BytesMut::with_capacity(total);
        for m in messages {
            block.extend_from_slice(&m.framed);
        }
        let block = block.freeze();

        let mut offset = 0usize;
        let mut expected_bytes: i64 = 0;
        let mut txs_bytes: i64 = 0;
        let mut overhead_bytes: i64 = 0;

        for msg in messages {
            let slice = block.slice(offset..offset + msg.framed.len());
            offset += msg.framed.len();

            for &orig_tag in &msg.tags {
                if core.locality == LOCALITY_SATELLITE {
                    if !(orig_tag == Tag::TXS || orig_tag.locality == LOCALITY_LOG_ROUTER) {
                        continue;
                    }
                } else if !(core.locality == LOCALITY_SPECIAL
                    || core.locality == orig_tag.locality
                    || orig_tag.locality < 0)
                {
                    continue;
                }

                let mut tag = orig_tag;
                if tag.locality == LOCALITY_LOG_ROUTER {
                    if core.log_router_tags == 0 {
                        continue;
                    }
                    tag.id = (tag.id as i32 % core.log_router_tags) as u16;
                }

                if !core.tag_data.contains_key(&tag) {
                    self.create_tag_data(core, tag, 0, true, true, false);
                }
                let td = core.tag_data.get_mut(&tag).unwrap();

                if version >= td.popped {
                    let size = slice.len() as i64 - 4;
                    td.version_messages.push_back((version, slice.clone()));
                    if size as usize > config.max_message_size {
                        warn!(
                            log_id = %self.log_id,
                            size,
                            tag = %tag,
                            "unusually large message indexed"
                        );
                    }
                    if tag != Tag::TXS {
                        expected_bytes += size;
                    } else {
                        txs_bytes += size;
                    }
                    overhead_bytes += config.version_message_entry_overhead;
                }
            }
        }

        core.message_blocks.push_back((version, block.clone()));
        let mut added_bytes =
            (block.len() as f64 * config.block_overhead_factor) as i64;
        added_bytes += overhead_bytes;

        core.version_sizes.insert(version, (expected_bytes, txs_bytes));
        core.bytes_input += added_bytes;
        shared.bytes_input.fetch_add(added_bytes, Ordering::Relaxed);
        shared
            .overhead_bytes_input
            .fetch_add(overhead_bytes, Ordering::Relaxed);
    }

    /// Drop per-tag entries below `before`, maintaining the per-version size
    /// sums and durable-byte accounting.
    pub fn erase_messages_before(
        core: &mut InstanceCore,
        tag: Tag,
        before: Version,
        entry_overhead: i64,
        shared: &SharedBytes,
    ) {
        let InstanceCore {
            tag_data,
            version_sizes,
            bytes_durable,
            ..
        } = core;
        let Some(td) = tag_data.get_mut(&tag) else {
            return;
        };

        let mut erased_entries: i64 = 0;
        while let Some((version, msg)) = td.version_messages.front() {
            if *version >= before {
                break;
            }
            if let Some(sizes) = version_sizes.get_mut(version) {
                let size = msg.len() as i64 - 4;
                if tag != Tag::TXS {
                    sizes.0 -= size;
                } else {
                    sizes.1 -= size;
                }
            }
            erased_entries += 1;
            td.version_messages.pop_front();
        }

        let bytes_erased = erased_entries * entry_overhead;
        *bytes_durable += bytes_erased;
        shared.bytes_durable.fetch_add(bytes_erased, Ordering::Relaxed);
        shared
            .overhead_bytes_durable
            .fetch_add(bytes_erased, Ordering::Relaxed);
    }

    /// Forget queue locations for versions before `up_to`, keeping the
    /// nearest version at or before it (spill and pop still need that one
    /// location to bound the live queue prefix).
    pub fn forget_version_locations_before(core: &mut InstanceCore, up_to: Version) {
        let keep_from = match core
            .version_location
            .range((Bound::Unbounded, Bound::Excluded(up_to)))
            .next_back()
        {
            Some((&v, _)) => v,
            None => return,
        };
        // `keep_from` is the predecessor; drop strictly before it.
        let doomed: Vec<Version> = core
            .version_location
            .range((Bound::Unbounded, Bound::Excluded(keep_from)))
            .map(|(&v, _)| v)
            .collect();
        for v in doomed {
            core.version_location.remove(&v);
        }
    }

    /// First queue location at or after `version`, if still tracked.
    pub fn location_at_or_after(
        core: &InstanceCore,
        version: Version,
    ) -> Option<(Version, Location)> {
        core.version_location
            .range(version..)
            .next()
            .map(|(&v, &(start, _))| (v, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taglog_core::message::MessageSetBuilder;
    use taglog_core::message::parse_messages;

    fn test_instance(locality: i8, log_router_tags: i32) -> Instance {
        Instance::new(
            Uid::random(),
            Uid::random(),
            1,
            taglog_core::PROTOCOL_VERSION,
            true,
            locality,
            log_router_tags,
            vec![],
        )
    }

    fn msgs(entries: &[(u32, Vec<Tag>, &[u8])]) -> Vec<TaggedMessage> {
        let mut b = MessageSetBuilder::new();
        for (sub, tags, payload) in entries {
            b.push(*sub, tags, payload);
        }
        parse_messages(&b.build()).unwrap()
    }

    #[test]
    fn test_commit_messages_routes_by_tag() {
        let inst = test_instance(0, 0);
        let shared = SharedBytes::default();
        let config = TLogConfig::default();
        let t1 = Tag::new(0, 1);
        let t2 = Tag::new(0, 2);

        let batch = msgs(&[
            (1, vec![t1], b"one"),
            (2, vec![t1, t2], b"both"),
            (3, vec![Tag::TXS], b"sys"),
        ]);
        let mut core = inst.core.lock().unwrap();
        inst.commit_messages(&mut core, 10, &batch, &config, &shared);

        assert_eq!(core.tag_data[&t1].version_messages.len(), 2);
        assert_eq!(core.tag_data[&t2].version_messages.len(), 1);
        assert_eq!(core.tag_data[&Tag::TXS].version_messages.len(), 1);
        let (bytes, txs) = core.version_sizes[&10];
        assert!(bytes > 0 && txs > 0);
        assert_eq!(core.message_blocks.len(), 1);
        assert!(core.bytes_input > 0);
        assert_eq!(shared.input(), core.bytes_input);
    }

    #[test]
    fn test_commit_messages_locality_filter() {
        let inst = test_instance(1, 0);
        let shared = SharedBytes::default();
        let config = TLogConfig::default();
        let local = Tag::new(1, 0);
        let foreign = Tag::new(2, 0);

        let batch = msgs(&[(1, vec![local, foreign], b"x")]);
        let mut core = inst.core.lock().unwrap();
        inst.commit_messages(&mut core, 5, &batch, &config, &shared);

        assert!(core.tag_data.contains_key(&local));
        assert!(!core.tag_data.contains_key(&foreign));
    }

    #[test]
    fn test_satellite_keeps_only_txs_and_router() {
        let inst = test_instance(LOCALITY_SATELLITE, 2);
        let shared = SharedBytes::default();
        let config = TLogConfig::default();
        let regional = Tag::new(0, 1);
        let router = Tag::new(LOCALITY_LOG_ROUTER, 3);

        let batch = msgs(&[(1, vec![regional, router, Tag::TXS], b"x")]);
        let mut core = inst.core.lock().unwrap();
        inst.commit_messages(&mut core, 5, &batch, &config, &shared);

        assert!(!core.tag_data.contains_key(&regional));
        assert!(core.tag_data.contains_key(&Tag::TXS));
        // Router id reduced modulo the router count: 3 % 2 == 1.
        assert!(core
            .tag_data
            .contains_key(&Tag::new(LOCALITY_LOG_ROUTER, 1)));
    }

    #[test]
    fn test_messages_below_popped_not_indexed() {
        let inst = test_instance(0, 0);
        let shared = SharedBytes::default();
        let config = TLogConfig::default();
        let t = Tag::new(0, 1);

        {
            let mut core = inst.core.lock().unwrap();
            inst.create_tag_data(&mut core, t, 20, true, true, false);
        }
        let batch = msgs(&[(1, vec![t], b"stale")]);
        let mut core = inst.core.lock().unwrap();
        inst.commit_messages(&mut core, 10, &batch, &config, &shared);
        assert!(core.tag_data[&t].version_messages.is_empty());
    }

    #[test]
    fn test_erase_messages_before() {
        let inst = test_instance(0, 0);
        let shared = SharedBytes::default();
        let config = TLogConfig::default();
        let t = Tag::new(0, 1);

        let mut core = inst.core.lock().unwrap();
        for v in [10, 11, 12] {
            let batch = msgs(&[(1, vec![t], b"payload")]);
            inst.commit_messages(&mut core, v, &batch, &config, &shared);
        }
        assert_eq!(core.tag_data[&t].version_messages.len(), 3);

        Instance::erase_messages_before(&mut core, t, 12, 32, &shared);
        assert_eq!(core.tag_data[&t].version_messages.len(), 1);
        assert_eq!(core.tag_data[&t].version_messages[0].0, 12);
        // Size sums for erased versions went to zero.
        assert_eq!(core.version_sizes[&10].0, 0);
        assert_eq!(core.version_sizes[&11].0, 0);
        assert!(core.version_sizes[&12].0 > 0);
        assert_eq!(shared.durable(), 2 * 32);
    }

    #[test]
    fn test_create_tag_data_floors_unannounced_tags() {
        let mut inst = test_instance(0, 0);
        inst.all_tags = [Tag::new(0, 1)].into_iter().collect();
        let mut core = inst.core.lock().unwrap();
        core.recovered_at = 100;

        let announced = inst.create_tag_data(&mut core, Tag::new(0, 1), 0, true, true, false);
        assert_eq!(announced.popped, 0);
        drop(core);

        let mut core = inst.core.lock().unwrap();
        let stranger = inst.create_tag_data(&mut core, Tag::new(0, 9), 0, true, true, false);
        assert_eq!(stranger.popped, 101);
    }

    #[test]
    fn test_forget_version_locations_keeps_predecessor() {
        let inst = test_instance(0, 0);
        let mut core = inst.core.lock().unwrap();
        for (v, loc) in [(10, 0u64), (12, 100), (14, 200)] {
            core.version_location.insert(v, (loc, loc + 50));
        }
        Instance::forget_version_locations_before(&mut core, 14);
        // 12 is the nearest version before 14; only 10 is dropped.
        assert!(!core.version_location.contains_key(&10));
        assert!(core.version_location.contains_key(&12));
        assert!(core.version_location.contains_key(&14));
        assert_eq!(
            Instance::location_at_or_after(&core, 13),
            Some((14, 200))
        );
    }

    #[tokio::test]
    async fn test_recovery_status_first_outcome_wins() {
        let inst = test_instance(0, 0);
        inst.set_recovery_status(RecoveryStatus::Failed);
        inst.set_recovery_status(RecoveryStatus::Complete);
        assert_eq!(inst.recovery_status(), RecoveryStatus::Failed);
    }
}
