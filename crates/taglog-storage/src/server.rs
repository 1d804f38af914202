//! TagLog Server
//!
//! The process-wide coordinator. One `TLogServer` owns one disk queue and
//! one index store, hosts any number of log instances across generations,
//! and runs the shared background work: the queue-commit worker, the spill
//! loop, and peek-tracker garbage collection.
//!
//! ## Shared vs Per-Instance
//!
//! ```text
//!                      TLogServer (shared)
//!   +--------+--------+--------+--------+--------+
//!   | gen 12 | gen 13 | gen 14 | gen 15 | gen 16 |
//!   +--------+--------+--------+--------+--------+
//!     ^ pop order       ^ spill order       ^ committing
//! ```
//!
//! The disk queue is popped from the *oldest* live instance, spilled from
//! the oldest instance with data still in memory, and committed to by the
//! *newest* (the only non-stopped) instance. Recruiting a new generation
//! stops every earlier one.
//!
//! ## Usage
//!
//! ```ignore
//! use taglog_storage::{TLogServer, TLogConfig};
//! use taglog_core::{InitializeRequest, CommitRequest, PeekRequest};
//!
//! let server = TLogServer::open(TLogConfig {
//!     data_dir: "/var/lib/taglog".into(),
//!     ..Default::default()
//! }).await?;
//!
//! // After a restart, earlier generations come back read-only:
//! for handle in server.recovered_instances() {
//!     println!("recovered {}", handle.log_id());
//! }
//!
//! let log = server.recruit(InitializeRequest::fresh(0)).await?;
//! log.commit(CommitRequest { /* ... */ }).await?;
//! let reply = log.peek(PeekRequest { /* ... */ }).await?;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taglog_core::{
    CommitRequest, Error, InitializeRequest, LockResult, PeekReply, PeekRequest, PopRequest,
    QueuingMetricsReply, Result, Uid, Version, PROTOCOL_VERSION,
};

use crate::commit;
use crate::config::TLogConfig;
use crate::disk_queue::DiskQueue;
use crate::instance::{Instance, RecoveryStatus, SharedBytes};
use crate::keys;
use crate::kv::KeyValueStore;
use crate::log_queue::{LogQueue, TLogQueueEntry};
use crate::memkv::MemKvStore;
use crate::peek::{self, PeekTracker};
use crate::pop;
use crate::recovery;
use crate::spill;
use crate::watch::{ByteLimiter, Trigger, VersionWatch};

/// Process-wide shared state. Everything an instance needs beyond its own
/// [`Instance`] lives here, passed explicitly - there are no globals.
pub(crate) struct Shared {
    pub dbgid: Uid,
    pub instance_id: i64,
    pub config: TLogConfig,
    pub queue: LogQueue,
    pub kv: Arc<dyn KeyValueStore>,

    pub instances: Mutex<BTreeMap<Uid, Arc<Instance>>>,
    /// Oldest-first: the disk queue pops from the front instance.
    pub pop_order: Mutex<VecDeque<Uid>>,
    /// Oldest-first: the spill loop drains the front instance.
    pub spill_order: Mutex<VecDeque<Uid>>,

    pub bytes: SharedBytes,
    pub queue_commit_begin: AtomicI64,
    pub queue_commit_end: VersionWatch,
    pub disk_queue_commit_bytes: AtomicI64,
    pub large_commit_bytes: watch::Sender<bool>,

    pub peek_tracker: Mutex<PeekTracker>,
    pub peek_memory_limiter: ByteLimiter,
    pub concurrent_log_router_reads: Semaphore,
    /// At most one spill commit at a time.
    pub persistent_data_commit_lock: tokio::sync::Mutex<()>,
    pub ignore_pops: Mutex<pop::IgnorePopState>,

    pub new_instance: Trigger,
    pub shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn instance(&self, id: Uid) -> Option<Arc<Instance>> {
        self.instances.lock().unwrap().get(&id).cloned()
    }

    fn front_of_order(&self, order: &Mutex<VecDeque<Uid>>) -> Option<Arc<Instance>> {
        let instances = self.instances.lock().unwrap();
        let mut order = order.lock().unwrap();
        while let Some(front) = order.front() {
            if let Some(instance) = instances.get(front) {
                return Some(instance.clone());
            }
            order.pop_front();
        }
        None
    }

    pub(crate) fn front_of_pop_order(&self) -> Option<Arc<Instance>> {
        self.front_of_order(&self.pop_order)
    }

    pub(crate) fn front_of_spill_order(&self) -> Option<Arc<Instance>> {
        self.front_of_order(&self.spill_order)
    }

    pub(crate) fn retire_from_spill_order(&self, id: Uid) {
        let mut order = self.spill_order.lock().unwrap();
        if order.front() == Some(&id) {
            order.pop_front();
        }
    }
}

/// A shared TagLog process: one disk queue, one index store, many
/// generations.
pub struct TLogServer {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TLogServer {
    /// Open (or create) a server rooted at `config.data_dir`, recovering
    /// any durable state from a previous run.
    pub async fn open(config: TLogConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let dbgid = Uid::random();

        let raw_queue = Arc::new(
            DiskQueue::open(config.data_dir.join("taglog.wal"), config.queue_disk_budget).await?,
        );
        let queue = LogQueue::new(raw_queue, dbgid);
        let kv: Arc<dyn KeyValueStore> = MemKvStore::open(
            config.data_dir.join("taglog.kv"),
            dbgid,
            config.kv_memory_limit,
            config.queue_disk_budget,
        )
        .await?;

        let shared = Arc::new(Shared {
            dbgid,
            instance_id: Uid::random().first() as i64,
            peek_memory_limiter: ByteLimiter::new(config.spill_reference_max_peek_memory_bytes),
            concurrent_log_router_reads: Semaphore::new(config.concurrent_log_router_reads),
            config,
            queue,
            kv,
            instances: Mutex::new(BTreeMap::new()),
            pop_order: Mutex::new(VecDeque::new()),
            spill_order: Mutex::new(VecDeque::new()),
            bytes: SharedBytes::default(),
            queue_commit_begin: AtomicI64::new(0),
            queue_commit_end: VersionWatch::new(0),
            disk_queue_commit_bytes: AtomicI64::new(0),
            large_commit_bytes: watch::channel(false).0,
            peek_tracker: Mutex::new(PeekTracker::new()),
            persistent_data_commit_lock: tokio::sync::Mutex::new(()),
            ignore_pops: Mutex::new(pop::IgnorePopState::default()),
            new_instance: Trigger::new(),
            shutdown: watch::channel(false).0,
        });

        info!(dbgid = %dbgid, "shared taglog starting");
        recovery::restore(&shared).await?;

        let tasks = vec![
            tokio::spawn(commit::queue_commit_loop(shared.clone())),
            tokio::spawn(spill::update_storage_loop(shared.clone())),
            tokio::spawn(peek::peek_tracker_cleanup_loop(shared.clone())),
        ];

        Ok(TLogServer {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Instances restored from disk by [`TLogServer::open`], stopped but
    /// peekable, oldest generation first.
    pub fn recovered_instances(&self) -> Vec<InstanceHandle> {
        let instances = self.shared.instances.lock().unwrap();
        let order = self.shared.pop_order.lock().unwrap();
        order
            .iter()
            .filter_map(|id| instances.get(id))
            .map(|instance| InstanceHandle {
                shared: self.shared.clone(),
                instance: instance.clone(),
            })
            .collect()
    }

    /// Recruit a new log instance, stopping every earlier generation.
    pub async fn recruit(&self, req: InitializeRequest) -> Result<InstanceHandle> {
        let shared = &self.shared;
        if *shared.shutdown.borrow() {
            return Err(Error::RecruitmentFailed("server shut down".into()));
        }

        {
            let instances = shared.instances.lock().unwrap();
            for existing in instances.values() {
                if !existing.is_stopped() {
                    info!(
                        log_id = %existing.log_id,
                        "instance stopped by new recruitment"
                    );
                }
                existing.set_stopped();
                if existing.recovery_status() == RecoveryStatus::Pending {
                    existing.set_recovery_status(RecoveryStatus::Failed);
                }
                existing.stop_commit.trigger();
            }
        }

        let log_id = Uid::random();
        let instance = Arc::new(Instance::new(
            log_id,
            req.recruitment_id,
            req.epoch,
            PROTOCOL_VERSION,
            req.is_primary,
            req.locality,
            req.log_router_tags,
            req.all_tags.clone(),
        ));
        {
            shared
                .instances
                .lock()
                .unwrap()
                .insert(log_id, instance.clone());
            shared.pop_order.lock().unwrap().push_back(log_id);
            shared.spill_order.lock().unwrap().push_back(log_id);
        }

        if req.recovering {
            {
                let mut core = instance.core.lock().unwrap();
                core.unrecovered_before = req.start_version;
                core.recovered_at = req.recover_at;
                core.known_committed_version = req.start_version - 1;
                core.persistent_data_version = req.start_version - 1;
                core.persistent_data_durable_version = req.start_version - 1;
                core.unpopped_recovered_tags = req.all_tags.len();
            }
            instance.queue_committed_version.set(req.start_version - 1);
            instance.version.set(req.start_version - 1);

            self.init_persistent_state(&instance).await?;
            instance.core.lock().unwrap().initialized = true;
            shared.new_instance.trigger();

            info!(
                log_id = %log_id,
                start_version = req.start_version,
                recover_at = req.recover_at,
                tags = req.all_tags.len(),
                "instance recruited for recovery"
            );

            // Transferring the recovered span itself belongs to the log
            // system layer above; once it has (or when there is nothing to
            // transfer), the version jumps to the recovery point with an
            // empty record so the new generation starts past it.
            if instance.version.get() < req.recover_at && !instance.is_stopped() {
                let known_committed_version = {
                    let core = instance.core.lock().unwrap();
                    core.known_committed_version
                };
                let entry = TLogQueueEntry {
                    id: log_id,
                    version: req.recover_at,
                    known_committed_version,
                    messages: bytes::Bytes::new(),
                };
                let (start, end) = shared.queue.push(&entry);
                let mut core = instance.core.lock().unwrap();
                core.version_location.insert(req.recover_at, (start, end));
                drop(core);
                instance.version.set(req.recover_at);
            }
        } else {
            self.init_persistent_state(&instance).await?;
            instance.core.lock().unwrap().initialized = true;
            shared.new_instance.trigger();
            instance.set_recovery_status(RecoveryStatus::Complete);
            info!(log_id = %log_id, "fresh instance recruited");
        }

        // Do not accept work until the queue-commit worker is committing on
        // our behalf.
        let mut adopted = instance.committing_adopted.subscribe();
        let mut removed = instance.removed.subscribe();
        tokio::select! {
            _ = adopted.wait_for(|a| *a) => {}
            _ = removed.wait_for(|r| *r) => return Err(Error::WorkerRemoved),
        }

        Ok(InstanceHandle {
            shared: shared.clone(),
            instance,
        })
    }

    /// First write of a brand-new instance's durable identity, committed
    /// before it accepts anything.
    async fn init_persistent_state(&self, instance: &Arc<Instance>) -> Result<()> {
        let shared = &self.shared;
        let _commit_guard = shared.persistent_data_commit_lock.lock().await;
        let kv = &shared.kv;
        let id = instance.log_id;

        kv.set(keys::FORMAT_KEY, keys::FORMAT_VALUE);
        kv.set(
            &keys::per_instance_key(keys::CURRENT_VERSION_PREFIX, id),
            &keys::encode_version_value(instance.version.get()),
        );
        {
            let core = instance.core.lock().unwrap();
            kv.set(
                &keys::per_instance_key(keys::KNOWN_COMMITTED_PREFIX, id),
                &keys::encode_version_value(core.known_committed_version),
            );
            kv.set(
                &keys::per_instance_key(keys::LOCALITY_PREFIX, id),
                &keys::encode_i8_value(core.locality),
            );
            kv.set(
                &keys::per_instance_key(keys::LOG_ROUTER_TAGS_PREFIX, id),
                &keys::encode_i32_value(core.log_router_tags),
            );
        }
        kv.set(
            &keys::per_instance_key(keys::RECOVERY_COUNT_PREFIX, id),
            &keys::encode_u64_value(instance.recovery_count),
        );
        kv.set(
            &keys::per_instance_key(keys::PROTOCOL_VERSION_PREFIX, id),
            &keys::encode_u64_value(instance.protocol_version),
        );

        {
            let mut core = instance.core.lock().unwrap();
            let tags: Vec<_> = instance.all_tags.iter().copied().collect();
            for tag in tags {
                debug_assert!(!core.tag_data.contains_key(&tag));
                instance.create_tag_data(&mut core, tag, 0, true, true, true);
                spill::update_persistent_popped(shared, instance, &mut core, tag);
            }
        }

        debug!(log_id = %id, "initial persistent state committed");
        kv.commit().await
    }

    /// Signal every background task to stop and release the index store.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        self.shared.kv.close();
        info!(dbgid = %self.shared.dbgid, "shared taglog stopped");
    }
}

/// A handle to one log instance; the unit requests are addressed to.
#[derive(Clone)]
pub struct InstanceHandle {
    shared: Arc<Shared>,
    instance: Arc<Instance>,
}

impl InstanceHandle {
    pub fn log_id(&self) -> Uid {
        self.instance.log_id
    }

    pub fn is_stopped(&self) -> bool {
        self.instance.is_stopped()
    }

    /// Highest accepted version.
    pub fn version(&self) -> Version {
        self.instance.version.get()
    }

    /// Highest version whose data is durably reflected in the index store.
    pub fn persistent_data_durable_version(&self) -> Version {
        self.instance
            .core
            .lock()
            .unwrap()
            .persistent_data_durable_version
    }

    /// Push a committed mutation batch. Replies with the durable
    /// known-committed version once the batch is on disk.
    pub async fn commit(&self, req: CommitRequest) -> Result<Version> {
        if self.instance.is_stopped() {
            return Err(Error::Stopped);
        }
        commit::handle_commit(&self.shared, &self.instance, req).await
    }

    /// Read messages for one tag starting at `begin`.
    pub async fn peek(&self, req: PeekRequest) -> Result<PeekReply> {
        peek::handle_peek(&self.shared, &self.instance, req).await
    }

    /// Acknowledge consumption for one tag.
    pub async fn pop(&self, req: PopRequest) -> Result<()> {
        pop::handle_pop(&self.shared, &self.instance, req).await
    }

    /// Stop accepting commits and drain queue durability; the first stage
    /// of recovery by a successor generation.
    pub async fn lock(&self) -> Result<LockResult> {
        let instance = &self.instance;
        let stop_version = instance.version.get();
        info!(
            log_id = %instance.log_id,
            version = stop_version,
            queue_committed = instance.queue_committed_version.get(),
            "lock request; instance stopping"
        );

        instance.set_stopped();
        if instance.recovery_status() == RecoveryStatus::Pending {
            instance.set_recovery_status(RecoveryStatus::Failed);
        }

        instance
            .queue_committed_version
            .when_at_least(stop_version)
            .await;
        debug_assert_eq!(stop_version, instance.version.get());

        let known_committed_version = {
            let core = instance.core.lock().unwrap();
            core.known_committed_version
        };
        Ok(LockResult {
            end: stop_version,
            known_committed_version,
        })
    }

    /// Health probe used by read-version requests; fails once stopped.
    pub fn confirm_running(&self, debug_id: Option<Uid>) -> Result<()> {
        if let Some(debug_id) = debug_id {
            debug!(debug_id = %debug_id, log_id = %self.instance.log_id, "confirm running");
        }
        if self.instance.is_stopped() {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    /// Resolves once this instance's recovery completed. Never resolves for
    /// an instance whose recovery failed.
    pub async fn recovery_finished(&self) {
        let mut rx = self.instance.recovery_status.subscribe();
        let status = match rx.wait_for(|s| *s != RecoveryStatus::Pending).await {
            Ok(status) => *status,
            Err(_) => return,
        };
        if status == RecoveryStatus::Failed {
            futures::future::pending::<()>().await;
        }
    }

    /// Queue depth report for upstream admission control.
    pub fn queuing_metrics(&self) -> QueuingMetricsReply {
        let local_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        QueuingMetricsReply {
            local_time,
            instance_id: self.shared.instance_id,
            bytes_durable: self.shared.bytes.durable(),
            bytes_input: self.shared.bytes.input(),
            storage_bytes: self.shared.kv.storage_bytes(),
            v: self
                .instance
                .core
                .lock()
                .unwrap()
                .durable_known_committed_version,
        }
    }

    /// Arm the pop gate: buffer pops instead of applying them, so an
    /// operator can take a consistent filesystem-level snapshot.
    pub fn disable_pops(&self, uid: Uid) {
        pop::disable_pops(&self.shared, uid);
    }

    /// Disarm the pop gate and replay everything buffered behind it.
    pub async fn enable_pops(&self, uid: Uid) -> Result<()> {
        pop::enable_pops(&self.shared, &self.instance, uid).await
    }

    /// Resolves when this instance is torn down, with the error its clients
    /// should see.
    pub async fn removed(&self) -> Error {
        let mut rx = self.instance.removed.subscribe();
        let _ = rx.wait_for(|r| *r).await;
        Error::WorkerRemoved
    }

    /// Tear the instance down: erase its durable identity and drop it from
    /// the process. Its clients observe `WorkerRemoved`.
    pub async fn remove(self) -> Result<()> {
        let shared = &self.shared;
        let instance = &self.instance;
        let id = instance.log_id;

        instance.set_stopped();
        if instance.recovery_status() == RecoveryStatus::Pending {
            instance.set_recovery_status(RecoveryStatus::Failed);
        }

        {
            let mut core = instance.core.lock().unwrap();
            let remaining = core.bytes_input - core.bytes_durable;
            core.bytes_durable = core.bytes_input;
            shared
                .bytes
                .bytes_durable
                .fetch_add(remaining, Ordering::Relaxed);
            if shared.bytes.durable() > shared.bytes.input() {
                warn!(log_id = %id, "byte accounting skew at instance removal");
            }
        }

        {
            let _commit_guard = shared.persistent_data_commit_lock.lock().await;
            for prefix in [
                keys::CURRENT_VERSION_PREFIX,
                keys::KNOWN_COMMITTED_PREFIX,
                keys::LOCALITY_PREFIX,
                keys::LOG_ROUTER_TAGS_PREFIX,
                keys::RECOVERY_COUNT_PREFIX,
                keys::PROTOCOL_VERSION_PREFIX,
            ] {
                shared.kv.clear(&keys::per_instance_key(prefix, id));
            }
            for prefix in [
                keys::TAG_MESSAGES_PREFIX,
                keys::TAG_MESSAGE_REFS_PREFIX,
                keys::TAG_POPPED_PREFIX,
            ] {
                shared.kv.clear_range(
                    &keys::per_instance_key(prefix, id),
                    &keys::per_instance_key_end(prefix, id),
                );
            }
            shared.kv.commit().await?;
        }

        shared.instances.lock().unwrap().remove(&id);
        // Dead ids are lazily skimmed off the order queues.
        instance.removed.send_replace(true);
        info!(log_id = %id, "instance removed");
        Ok(())
    }
}
