//! Commit Pipeline
//!
//! Accepts `CommitRequest`s from proxies, appends them to the framed log
//! queue, and replies only once the batch is durable.
//!
//! ## Request Lifecycle
//!
//! 1. **Ordering**: wait until the instance's version reaches
//!    `prev_version`. Commits arrive concurrently but apply in version
//!    order.
//! 2. **Backpressure**: while the shared un-durable window exceeds the hard
//!    limit, sleep (jittered) rather than accept; a lag warning is emitted
//!    at most once per second. Backpressure never errors.
//! 3. **Deduplication**: if the instance's version already passed
//!    `prev_version`, this is a retry of an accepted commit; skip the
//!    append and fall through to the reply barrier.
//! 4. **Acceptance** (a synchronous critical section): route messages into
//!    the per-tag index, push the framed record to the log queue, record its
//!    queue locations, and publish the new version - which unblocks waiting
//!    peeks and the queue-commit worker.
//! 5. **Reply barrier**: wait for `queue_committed_version >= version`, or a
//!    stop-commit signal from a displacing generation (-> `Stopped`). A
//!    stall past 100ms is surfaced as a warning.
//!
//! ## The Queue-Commit Worker
//!
//! A single background loop picks the one non-stopped instance, waits for
//! new versions, and runs disk-queue commits with at most one in flight
//! (two, when a commit group grows past `max_queue_commit_bytes` and the
//! next is cut early). After each fsync it advances
//! `queue_committed_version` and `durable_known_committed_version`, which
//! releases every commit waiting at the reply barrier, and gives displaced
//! instances their final commit.

use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use taglog_core::message::parse_messages;
use taglog_core::{CommitRequest, Error, Result, Version};

use crate::instance::{Instance, RecoveryStatus};
use crate::log_queue::TLogQueueEntry;
use crate::server::Shared;

/// Handle one commit request against one instance.
///
/// Suspends for: version ordering (1), backpressure (2), the exec-op lock,
/// and queue durability (5).
pub(crate) async fn handle_commit(
    shared: &Arc<Shared>,
    instance: &Arc<Instance>,
    req: CommitRequest,
) -> Result<Version> {
    if let Some(debug_id) = req.debug_id {
        debug!(debug_id = %debug_id, version = req.version, "commit request received");
    }

    {
        let mut core = instance.core.lock().unwrap();
        core.min_known_committed_version = core
            .min_known_committed_version
            .max(req.min_known_committed_version);
    }

    instance.version.when_at_least(req.prev_version).await;

    // Backpressure: hold the commit (without erroring) while spill lags.
    let mut last_warn: Option<Instant> = None;
    while shared.bytes.window() >= shared.config.hard_limit_bytes && !instance.is_stopped() {
        if last_warn.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
            let core = instance.core.lock().unwrap();
            warn!(
                log_id = %instance.log_id,
                version = instance.version.get(),
                persistent_data_version = core.persistent_data_version,
                persistent_data_durable_version = core.persistent_data_durable_version,
                "commit delayed: spill lagging behind input"
            );
            last_warn = Some(Instant::now());
        }
        sleep(jittered(Duration::from_millis(5))).await;
    }

    // An exec-tagged commit must be the only one between its version
    // publication and queue durability; ordinary commits queue behind it.
    let exec_guard = if req.has_exec_op || instance.exec_op_in_progress.load(Ordering::Acquire) {
        Some(instance.exec_op_lock.lock().await)
    } else {
        None
    };

    if instance.is_stopped() {
        return Err(Error::Stopped);
    }

    // Subscribe before acceptance so a displacement between acceptance and
    // the barrier cannot be missed.
    let stop_commit = instance.stop_commit.subscribe();

    {
        let mut core = instance.core.lock().unwrap();
        // Not a duplicate. The check-and-publish below is atomic under the
        // core lock; a racing retry of the same version lands in the
        // duplicate path.
        if instance.version.get() == req.prev_version {
            let messages = parse_messages(&req.messages)?;

            if req.has_exec_op {
                instance.exec_op_in_progress.store(true, Ordering::Release);
            }

            instance.commit_messages(&mut core, req.version, &messages, &shared.config, &shared.bytes);
            core.known_committed_version =
                core.known_committed_version.max(req.known_committed_version);

            let entry = TLogQueueEntry {
                id: instance.log_id,
                version: req.version,
                known_committed_version: core.known_committed_version,
                messages: req.messages.clone(),
            };
            let (start, end) = shared.queue.push(&entry);
            core.version_location.insert(req.version, (start, end));

            let commit_bytes = shared
                .disk_queue_commit_bytes
                .fetch_add(entry.expected_size() as i64, Ordering::Relaxed)
                + entry.expected_size() as i64;
            if commit_bytes > shared.config.max_queue_commit_bytes {
                shared.large_commit_bytes.send_replace(true);
            }

            // Publication: peeks blocked on this version and the queue
            // commit worker wake here.
            instance.version.set(req.version);
        }
    }

    // Reply only after this version is durable (or the instance was told to
    // stop committing by a displacing generation).
    let barrier = instance.queue_committed_version.when_at_least(req.version);
    let stopped = stop_commit.wait();
    tokio::pin!(barrier);
    tokio::pin!(stopped);
    let mut warned = false;
    let outcome = loop {
        tokio::select! {
            _ = &mut barrier => break Ok(()),
            _ = &mut stopped => break Err(Error::Stopped),
            _ = sleep(Duration::from_millis(100)), if !warned => {
                warned = true;
                warn!(
                    log_id = %instance.log_id,
                    version = req.version,
                    "queue commit slow"
                );
            }
        }
    };

    if let Some(guard) = exec_guard {
        if req.has_exec_op {
            instance.exec_op_in_progress.store(false, Ordering::Release);
        }
        drop(guard);
    }

    outcome?;
    Ok(instance.core.lock().unwrap().durable_known_committed_version)
}

fn jittered(d: Duration) -> Duration {
    d.mul_f64(0.9 + rand::thread_rng().gen::<f64>() * 0.2)
}

/// Commit the disk queue once and publish durability to `instance` (and a
/// final time to any displaced instances that never got theirs).
///
/// `version`, `commit_number`, and `known_committed_version` are captured
/// synchronously by the worker before this future is spawned, so a second
/// commit for the same version can never be scheduled.
async fn do_queue_commit(
    shared: Arc<Shared>,
    instance: Arc<Instance>,
    missing_final_commit: Vec<Arc<Instance>>,
    version: Version,
    commit_number: Version,
    known_committed_version: Version,
) -> Result<()> {
    shared.disk_queue_commit_bytes.store(0, Ordering::Relaxed);
    shared.large_commit_bytes.send_replace(false);

    let commit = shared.queue.commit();
    tokio::pin!(commit);
    let result = tokio::select! {
        r = &mut commit => r,
        _ = sleep(shared.config.degraded_duration) => {
            warn!(log_id = %instance.log_id, "disk queue commit degraded");
            commit.await
        }
    };
    result?;

    // Commits may overlap when a large group forces an early cut; publish
    // strictly in commit order.
    shared.queue_commit_end.when_at_least(commit_number - 1).await;

    debug_assert!(version >= instance.queue_committed_version.get());

    let recovery_ready = {
        let mut core = instance.core.lock().unwrap();
        core.durable_known_committed_version = known_committed_version;
        core.unpopped_recovered_tags == 0 && known_committed_version >= core.recovered_at
    };
    if recovery_ready && instance.recovery_status() == RecoveryStatus::Pending {
        info!(log_id = %instance.log_id, "instance recovery complete");
        instance.set_recovery_status(RecoveryStatus::Complete);
    }

    instance.queue_committed_version.set(version);
    shared.queue_commit_end.set(commit_number);

    for displaced in missing_final_commit {
        info!(
            log_id = %displaced.log_id,
            version = displaced.version.get(),
            "displaced instance granted final queue commit"
        );
        displaced
            .queue_committed_version
            .set(displaced.version.get());
    }
    Ok(())
}

/// The background queue-commit worker.
pub(crate) async fn queue_commit_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut shutdown_inner_outer = shared.shutdown.subscribe();

    'select_instance: loop {
        // Subscribe before scanning so a recruitment that lands in between
        // cannot be missed.
        let new_instance_wait = shared.new_instance.subscribe();
        let (committing, mut missing_final_commit) = {
            let instances = shared.instances.lock().unwrap();
            let mut committing = None;
            let mut missing = Vec::new();
            for inst in instances.values() {
                if !inst.is_stopped() {
                    committing = Some(inst.clone());
                } else {
                    let floor = {
                        let core = inst.core.lock().unwrap();
                        core.queue_committing_version
                            .max(inst.queue_committed_version.get())
                    };
                    if inst.version.get() > floor {
                        missing.push(inst.clone());
                    }
                }
            }
            (committing, missing)
        };

        let Some(instance) = committing else {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|s| *s).await; } => return,
                _ = new_instance_wait.wait() => continue,
            }
        };

        debug!(
            log_id = %instance.log_id,
            version = instance.version.get(),
            "queue commit worker adopted instance"
        );
        instance.committing_adopted.send_replace(true);

        loop {
            let new_instance_wait = shared.new_instance.subscribe();
            let floor = {
                let core = instance.core.lock().unwrap();
                core.queue_committing_version
                    .max(instance.queue_committed_version.get())
            };

            if instance.is_stopped() && instance.version.get() == floor {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => return,
                    _ = instance
                        .queue_committed_version
                        .when_at_least(instance.version.get()) => {}
                }
                continue 'select_instance;
            }

            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|s| *s).await; } => return,
                _ = instance.version.when_at_least(floor + 1) => {
                    // At most one commit in flight, unless an oversized
                    // group forces the next to start early.
                    loop {
                        let begin = shared.queue_commit_begin.load(Ordering::Acquire);
                        if shared.queue_commit_end.get() >= begin
                            || *shared.large_commit_bytes.borrow()
                        {
                            break;
                        }
                        let mut large_rx = shared.large_commit_bytes.subscribe();
                        tokio::select! {
                            _ = async { let _ = shutdown_inner_outer.wait_for(|s| *s).await; } => return,
                            _ = shared.queue_commit_end.when_at_least(begin) => {}
                            _ = large_rx.changed() => {}
                        }
                    }

                    // Capture the commit's identity synchronously so the
                    // next worker iteration sees it as in flight.
                    let version = instance.version.get();
                    let commit_number =
                        shared.queue_commit_begin.fetch_add(1, Ordering::AcqRel) + 1;
                    let known_committed_version = {
                        let mut core = instance.core.lock().unwrap();
                        core.queue_committing_version = version;
                        core.known_committed_version
                    };

                    let shared2 = shared.clone();
                    let instance2 = instance.clone();
                    let missing = std::mem::take(&mut missing_final_commit);
                    tokio::spawn(async move {
                        if let Err(e) = do_queue_commit(
                            shared2.clone(),
                            instance2,
                            missing,
                            version,
                            commit_number,
                            known_committed_version,
                        )
                        .await
                        {
                            error!(error = %e, "disk queue commit failed");
                            shared2.shutdown.send_replace(true);
                        }
                    });
                }
                _ = new_instance_wait.wait() => {
                    continue 'select_instance;
                }
            }
        }
    }
}
