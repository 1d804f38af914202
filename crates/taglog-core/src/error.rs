//! TagLog Error Types
//!
//! This module defines all error kinds surfaced by TagLog operations.
//!
//! ## Error Categories
//!
//! ### Lifecycle Errors
//! - `Stopped`: the instance will not accept new commits; the caller must
//!   locate a newer generation
//! - `WorkerRemoved`: this instance has been displaced by a newer generation
//! - `RecruitmentFailed`: a startup precondition was violated
//!
//! ### Streaming Errors
//! - `EndOfStream`: a peek would block forever (`return_if_blocked`), or a
//!   recovery cursor is exhausted
//! - `TimedOut`: a sequenced peek fell out of its tracker window
//!
//! ### Integrity Errors
//! - `ChecksumFailed`: a durable record failed validation
//! - `CorruptRecord`: a framed record could not be decoded
//! - `UnsupportedFormat`: the durable store was written by an unknown format
//! - `IncompatibleProtocolVersion`: peer handshake mismatch
//!
//! All operations return `Result<T>`, aliased to `Result<T, Error>`, so
//! errors propagate cleanly with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("log instance stopped")]
    Stopped,

    #[error("end of stream")]
    EndOfStream,

    #[error("request timed out")]
    TimedOut,

    #[error("log instance removed by a newer generation")]
    WorkerRemoved,

    #[error("recruitment failed: {0}")]
    RecruitmentFailed(String),

    #[error("incompatible protocol version: ours {ours:#x}, theirs {theirs:#x}")]
    IncompatibleProtocolVersion { ours: u64, theirs: u64 },

    #[error("checksum validation failed")]
    ChecksumFailed,

    #[error("unsupported durable format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("storage out of space")]
    OutOfSpace,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that indicate this process should shut the instance
    /// down permanently (durable data may be disposed).
    pub fn is_permanent_shutdown(&self) -> bool {
        matches!(self, Error::WorkerRemoved | Error::RecruitmentFailed(_))
    }
}
