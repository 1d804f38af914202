//! Core Types for TagLog
//!
//! This crate defines the vocabulary shared by every TagLog component:
//!
//! - **Version**: the 64-bit, monotonically increasing commit timestamp
//!   assigned upstream by a commit proxy. Gaps are allowed; ordering is total.
//! - **Tag**: the routing identifier attached to a message, selecting which
//!   consumer(s) receive it ([`tag`]).
//! - **Uid**: 128-bit identifiers for log instances and peers ([`uid`]).
//! - **Message framing**: the byte-exact wire layout of commit payloads and
//!   peek replies ([`message`]).
//! - **Request/reply schemas**: the operations a TagLog server exposes
//!   ([`api`]).
//! - **Errors**: every error kind surfaced to callers ([`error`]).
//!
//! The storage engine itself lives in the `taglog-storage` crate.

pub mod api;
pub mod error;
pub mod message;
pub mod tag;
pub mod uid;

pub use api::{
    CommitRequest, InitializeRequest, LockResult, PeekReply, PeekRequest, PopRequest,
    QueuingMetricsReply, StorageBytes,
};
pub use error::{Error, Result};
pub use message::TaggedMessage;
pub use tag::Tag;
pub use uid::Uid;

/// A commit version: a 64-bit, monotonically increasing timestamp.
pub type Version = i64;

/// Sentinel for "no version".
pub const INVALID_VERSION: Version = -1;

/// Protocol version stamped into durable records and checked on replay.
/// Bump the low word for compatible changes, the high word for breaking ones.
pub const PROTOCOL_VERSION: u64 = 0x7467_0b04_0000_0001;
