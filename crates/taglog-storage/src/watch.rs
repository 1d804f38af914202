//! Notification Primitives
//!
//! Two small wrappers over `tokio::sync` used throughout the engine:
//!
//! - [`VersionWatch`]: a monotonically increasing version with
//!   `when_at_least`, the backbone of commit ordering, the reply barrier,
//!   and spill pacing.
//! - [`ByteLimiter`]: a byte-counted semaphore capping in-flight memory for
//!   spilled-peek reads.

use std::sync::Arc;
use tokio::sync::{watch, Semaphore, SemaphorePermit};

use taglog_core::Version;

/// A monotonically increasing version observers can await.
#[derive(Debug)]
pub struct VersionWatch {
    tx: watch::Sender<Version>,
}

impl VersionWatch {
    pub fn new(initial: Version) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> Version {
        *self.tx.borrow()
    }

    /// Advance to `v`. Regressions are ignored; versions never go backwards.
    pub fn set(&self, v: Version) {
        self.tx.send_if_modified(|cur| {
            if v > *cur {
                *cur = v;
                true
            } else {
                false
            }
        });
    }

    pub async fn when_at_least(&self, v: Version) {
        if self.get() >= v {
            return;
        }
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this cannot fail while we're borrowed.
        let _ = rx.wait_for(|cur| *cur >= v).await;
    }
}

/// A byte-counted semaphore. Requests larger than the capacity are clamped so
/// they serialize instead of deadlocking.
#[derive(Debug)]
pub struct ByteLimiter {
    sem: Arc<Semaphore>,
    capacity: u64,
}

impl ByteLimiter {
    pub fn new(capacity: u64) -> Self {
        let permits = capacity.min(Semaphore::MAX_PERMITS as u64) as usize;
        Self {
            sem: Arc::new(Semaphore::new(permits)),
            capacity: permits as u64,
        }
    }

    pub async fn take(&self, bytes: u64) -> SemaphorePermit<'_> {
        let n = bytes.clamp(1, self.capacity) as u32;
        // acquire_many cannot fail: the semaphore is never closed.
        match self.sem.acquire_many(n).await {
            Ok(permit) => permit,
            Err(_) => unreachable!("byte limiter semaphore closed"),
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// An edge trigger: every call to [`Trigger::trigger`] wakes all current
/// waiters exactly once.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<u64>,
}

impl Trigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    /// A future resolving on the next trigger after this call.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.changed().await;
    }

    /// Subscribe first, await later; use when the trigger may fire between
    /// deciding to wait and waiting.
    pub fn subscribe(&self) -> TriggerWait {
        TriggerWait {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TriggerWait {
    rx: watch::Receiver<u64>,
}

impl TriggerWait {
    pub async fn wait(mut self) {
        let _ = self.rx.changed().await;
    }
}
