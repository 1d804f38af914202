//! Framed Log Queue
//!
//! Wraps the raw [`DiskQueue`] with record framing so that whole log entries
//! become atomic: after a crash, a prefix of entire `push` calls is
//! recoverable, built on the raw queue's weaker byte-prefix guarantee.
//!
//! ## Record Framing
//!
//! ```text
//! ┌─────────────┬──────────────────┬──────────────────┬────────────┐
//! │ payload len │ protocol version │ TLogQueueEntry   │ valid flag │
//! │ (u32)       │ (u64)            │ (len - 8 bytes)  │ (u8)       │
//! └─────────────┴──────────────────┴──────────────────┴────────────┘
//! ```
//!
//! `payload len` covers the protocol version through the end of the entry
//! (it excludes itself and the valid flag). A valid flag of 0 marks a record
//! that was torn by a crash and zero-filled on recovery; replay skips it.
//!
//! ## Torn-Tail Repair
//!
//! Recovery reads records in order. A short read of the length field or the
//! payload means the tail record never finished writing; we push enough zero
//! bytes to complete the damaged record *before* any subsequent push, so the
//! stream stays parseable forever after. A torn tail is not a failure.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, warn};

use taglog_core::{Error, Result, StorageBytes, Uid, Version, PROTOCOL_VERSION};

use crate::disk_queue::{DiskQueue, DiskQueueReader, Location};

/// Records larger than this fail decoding outright; nothing sane produces
/// them and a corrupt length field should not drive a huge allocation.
const MAX_RECORD_BYTES: u32 = 100 << 20;

/// One durable log record: a commit's messages for one instance at one
/// version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TLogQueueEntry {
    pub id: Uid,
    pub version: Version,
    pub known_committed_version: Version,
    pub messages: Bytes,
}

impl TLogQueueEntry {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.version);
        buf.put_u32_le(self.messages.len() as u32);
        buf.put_slice(&self.messages);
        buf.put_i64_le(self.known_committed_version);
        self.id.encode(buf);
    }

    fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(Error::CorruptRecord("truncated queue entry".into()));
        }
        let version = buf.get_i64_le();
        let msg_len = buf.get_u32_le() as usize;
        if buf.remaining() < msg_len + 24 {
            return Err(Error::CorruptRecord("queue entry messages overrun".into()));
        }
        let messages = buf.split_to(msg_len);
        let known_committed_version = buf.get_i64_le();
        let id = Uid::decode(&mut buf)?;
        Ok(TLogQueueEntry {
            id,
            version,
            known_committed_version,
            messages,
        })
    }

    pub fn expected_size(&self) -> usize {
        self.messages.len()
    }
}

/// Frame a record exactly as [`LogQueue::push`] would; exposed so spilled
/// peeks can size-check what they read back.
pub fn frame_entry(entry: &TLogQueueEntry) -> Bytes {
    let payload_len = 8 + 8 + 4 + entry.messages.len() + 8 + 16;
    let mut buf = BytesMut::with_capacity(4 + payload_len + 1);
    buf.put_u32_le(payload_len as u32);
    buf.put_u64_le(PROTOCOL_VERSION);
    entry.encode(&mut buf);
    buf.put_u8(1);
    buf.freeze()
}

/// Decode one framed record from a byte range read back out of the raw
/// queue. Verifies the valid flag and length before trusting the entry.
pub fn decode_framed_entry(mut record: Bytes) -> Result<TLogQueueEntry> {
    if record.len() < 5 {
        return Err(Error::CorruptRecord("framed record too short".into()));
    }
    let payload_len = (&record[..4]).get_u32_le() as usize;
    if record.len() != payload_len + 5 {
        return Err(Error::CorruptRecord(format!(
            "framed record length mismatch: header {} vs {} bytes",
            payload_len,
            record.len()
        )));
    }
    let valid = record[record.len() - 1];
    if valid != 1 {
        return Err(Error::ChecksumFailed);
    }
    record.advance(4);
    let protocol = record.get_u64_le();
    if protocol != PROTOCOL_VERSION {
        return Err(Error::IncompatibleProtocolVersion {
            ours: PROTOCOL_VERSION,
            theirs: protocol,
        });
    }
    TLogQueueEntry::decode(record.slice(..record.len() - 1))
}

/// The framed, durable log queue shared by every instance in the process.
pub struct LogQueue {
    queue: Arc<DiskQueue>,
    dbgid: Uid,
}

impl LogQueue {
    pub fn new(queue: Arc<DiskQueue>, dbgid: Uid) -> Self {
        Self { queue, dbgid }
    }

    /// Frame and buffer one entry; returns its `[start, end)` locations.
    pub fn push(&self, entry: &TLogQueueEntry) -> (Location, Location) {
        let framed = frame_entry(entry);
        self.queue.push(&framed)
    }

    /// Make pushed entries durable. See [`DiskQueue::commit`].
    pub async fn commit(&self) -> Result<()> {
        self.queue.commit().await
    }

    pub fn pop(&self, location: Location) {
        self.queue.pop(location);
    }

    pub fn popped_location(&self) -> Location {
        self.queue.popped_location()
    }

    /// Position the replay cursor; true when there is nothing to replay.
    pub fn initialize_recovery(&self, min_location: Location) -> bool {
        self.queue.initialize_recovery(min_location)
    }

    /// Read the next intact entry, or `None` at end of stream.
    ///
    /// A torn trailing record is diagnosed by short read and repaired by
    /// pushing zero bytes to complete it; zero-filled records are skipped.
    pub async fn read_next(&self) -> Result<Option<(TLogQueueEntry, Location, Location)>> {
        let mut zero_fill = 0usize;
        loop {
            let start = self.queue.next_read_location();
            let header = self.queue.read_next(4).await?;
            if header.len() != 4 {
                if !header.is_empty() {
                    // Partial length field: pad it with zeros, then treat the
                    // zero-extended length as the damaged record's size.
                    let mut size_bytes = [0u8; 4];
                    size_bytes[..header.len()].copy_from_slice(&header);
                    let payload_size = u32::from_le_bytes(size_bytes) as usize;
                    zero_fill = (4 - header.len()) + payload_size + 1;
                }
                break;
            }
            let payload_size = (&header[..]).get_u32_le();
            if payload_size >= MAX_RECORD_BYTES {
                return Err(Error::CorruptRecord(format!(
                    "implausible record size {payload_size}"
                )));
            }

            let body = self.queue.read_next(payload_size as usize + 1).await?;
            if body.len() != payload_size as usize + 1 {
                zero_fill = payload_size as usize + 1 - body.len();
                break;
            }

            let valid = body[payload_size as usize];
            if valid == 0 {
                // Zero-filled (aborted) record from an earlier repair.
                continue;
            }
            if valid != 1 {
                return Err(Error::CorruptRecord(format!(
                    "bad valid flag {valid:#x}"
                )));
            }

            let mut payload = body.slice(..payload_size as usize);
            let protocol = payload.get_u64_le();
            if protocol != PROTOCOL_VERSION {
                return Err(Error::IncompatibleProtocolVersion {
                    ours: PROTOCOL_VERSION,
                    theirs: protocol,
                });
            }
            let entry = TLogQueueEntry::decode(payload)?;
            let end = self.queue.next_read_location();
            return Ok(Some((entry, start, end)));
        }

        if zero_fill > 0 {
            warn!(
                dbgid = %self.dbgid,
                zero_fill,
                "repairing torn record at log queue tail"
            );
            self.queue.push(&vec![0u8; zero_fill]);
        } else {
            debug!(dbgid = %self.dbgid, "log queue replay complete");
        }
        Ok(None)
    }

    pub fn reader(&self) -> DiskQueueReader {
        self.queue.reader()
    }

    pub fn storage_bytes(&self) -> StorageBytes {
        self.queue.storage_bytes()
    }
}
