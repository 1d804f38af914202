//! Key-Value Store Capability Trait
//!
//! The spill pipeline persists its index through this small capability set
//! rather than a concrete store, so the in-memory log-backed store
//! ([`crate::memkv::MemKvStore`]) can be swapped for a disk-backed one
//! without touching the spill or peek code.
//!
//! ## Semantics
//!
//! - `set`/`clear_range` buffer mutations; nothing is visible to a restarted
//!   process until `commit` returns.
//! - `read_*` observe buffered mutations (read-your-writes within the
//!   process).
//! - `commit` makes every previously buffered mutation durable, atomically.
//! - A store that runs out of space must *stall* `commit` rather than fail
//!   it: the caller deliberately wedges until an operator intervenes.

use async_trait::async_trait;
use bytes::Bytes;

use taglog_core::{Result, StorageBytes};

/// One key-value pair returned by a range read.
pub type KeyValue = (Bytes, Bytes);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Complete any pending recovery. Must be called before first use.
    async fn init(&self) -> Result<()>;

    /// Buffer a set of `key` to `value`.
    fn set(&self, key: &[u8], value: &[u8]);

    /// Buffer a clear of a single key.
    fn clear(&self, key: &[u8]);

    /// Buffer a clear of every key in `[begin, end)`.
    fn clear_range(&self, begin: &[u8], end: &[u8]);

    async fn read_value(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Read keys in `[begin, end)`.
    ///
    /// A non-negative `row_limit` reads the first rows ascending; a negative
    /// one reads the last `-row_limit` rows descending. The total size of the
    /// result (less the final row) stays under `byte_limit`.
    async fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        row_limit: i32,
        byte_limit: usize,
    ) -> Result<Vec<KeyValue>>;

    /// Make all buffered mutations durable.
    async fn commit(&self) -> Result<()>;

    fn storage_bytes(&self) -> StorageBytes;

    /// Release background resources. The store is unusable afterwards.
    fn close(&self);

    /// Close and permanently delete the durable state. Only for instances
    /// that will never be recovered.
    fn dispose(&self);
}
