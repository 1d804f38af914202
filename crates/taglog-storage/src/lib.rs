//! TagLog Storage Engine
//!
//! A durable, tagged, versioned transaction log. Commit proxies push mutation
//! batches at monotonically increasing versions; storage servers subscribe
//! ("peek") to the stream filtered by tag and acknowledge consumption
//! ("pop"); a two-tier spill pipeline migrates old data out of memory into a
//! log-backed index store so the in-memory window stays bounded.
//!
//! ## Architecture
//!
//! ```text
//! proxy ──commit──▶ TLogServer ──push──▶ LogQueue ──▶ DiskQueue (WAL file)
//!                      │                                  ▲
//!                      │ index                            │ by-reference
//!                      ▼                                  │ reads
//!                  per-tag deques ──spill──▶ MemKvStore ──┘
//!                      ▲                        (index rows, own log file)
//!                      │
//! storage ──peek/pop───┘
//! ```
//!
//! One process hosts one [`TLogServer`], which may carry several log
//! *instances* across generations; they share one disk queue and one index
//! store. See [`server`] for the public API.

pub mod commit;
pub mod config;
pub mod disk_queue;
pub mod instance;
pub mod keys;
pub mod kv;
pub mod log_queue;
pub mod memkv;
pub mod peek;
pub mod pop;
pub mod recovery;
pub mod server;
pub mod spill;
pub mod watch;

pub use config::TLogConfig;
pub use disk_queue::{DiskQueue, Location};
pub use kv::KeyValueStore;
pub use memkv::MemKvStore;
pub use server::{InstanceHandle, TLogServer};

pub use taglog_core::{
    CommitRequest, Error, InitializeRequest, LockResult, PeekReply, PeekRequest, PopRequest,
    QueuingMetricsReply, Result, StorageBytes, Tag, TaggedMessage, Uid, Version,
};
