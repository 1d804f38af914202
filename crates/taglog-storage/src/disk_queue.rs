//! Raw Disk Queue
//!
//! The append-only byte stream at the bottom of the engine. Both the framed
//! log queue (the WAL proper) and the index store's operation log sit on one
//! of these, each with its own file.
//!
//! ## Contract
//!
//! - `push` buffers bytes in memory and assigns them a *location* (a logical
//!   byte offset that never resets). Nothing is durable yet.
//! - `commit` writes every buffered byte and fsyncs. On return, every record
//!   pushed before the call is durable. This is the durability boundary.
//! - `pop(location)` declares bytes before `location` reclaimable. The
//!   watermark is persisted by the next `commit`, and recovery never replays
//!   popped bytes.
//! - `initialize_recovery` + `read_next` stream the durable suffix back at
//!   startup; a short read means the durable stream ended.
//! - `reader()` hands out an independent handle for positional reads of
//!   durable byte ranges (used by spilled peeks).
//!
//! ## File Layout
//!
//! One file: a 4 KiB header page (magic, format, popped watermark, CRC32)
//! followed by the data region. Location `L` lives at file offset
//! `4096 + L`. The popped prefix is only logically reclaimed.
//!
//! Layered framing (the valid byte, zero-fill repair of torn records) is the
//! caller's business; this type knows nothing about record boundaries.

use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use taglog_core::{Error, Result, StorageBytes};

/// A logical byte offset into the queue. Never resets.
pub type Location = u64;

const HEADER_LEN: u64 = 4096;
const MAGIC: u64 = 0x5441_474c_4f47_5131; // "TAGLOGQ1"
const FORMAT: u32 = 1;

// TODO: physically reclaim the popped prefix (hole punching) once the file
// grows past the configured disk budget.

#[derive(Debug)]
struct QueueCore {
    /// Bytes pushed but not yet handed to a commit.
    write_buf: BytesMut,
    /// Location of the first byte in `write_buf`.
    buf_start: Location,
    /// Location the next push will receive.
    next_push: Location,
    /// Everything below this is durable on disk.
    durable: Location,
    /// Reclaimable prefix; persisted to the header on commit.
    popped: Location,
    /// The popped value the on-disk header currently holds.
    header_popped: Location,
    /// Recovery cursor.
    read_pos: Location,
}

/// A raw append-only queue backed by a single file.
pub struct DiskQueue {
    path: PathBuf,
    core: Mutex<QueueCore>,
    file: tokio::sync::Mutex<File>,
    disk_budget: i64,
}

impl DiskQueue {
    /// Open or create the queue file at `path`.
    pub async fn open(path: impl AsRef<Path>, disk_budget: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        let len = file.metadata().await?.len();
        let (durable, popped) = if len < HEADER_LEN {
            // Fresh (or torn before the header ever synced): lay down a
            // header and start empty.
            write_header(&mut file, 0).await?;
            file.set_len(HEADER_LEN).await?;
            file.sync_all().await?;
            (0, 0)
        } else {
            let popped = read_header(&mut file).await?;
            let durable = len - HEADER_LEN;
            (durable, popped.min(durable))
        };

        info!(
            path = %path.display(),
            durable,
            popped,
            "disk queue opened"
        );

        Ok(Self {
            path,
            core: Mutex::new(QueueCore {
                write_buf: BytesMut::new(),
                buf_start: durable,
                next_push: durable,
                durable,
                popped,
                header_popped: popped,
                read_pos: popped,
            }),
            file: tokio::sync::Mutex::new(file),
            disk_budget,
        })
    }

    /// The location the next push will start at.
    pub fn next_push_location(&self) -> Location {
        self.core.lock().unwrap().next_push
    }

    /// Buffer `payload` for the next commit; returns its `[start, end)`
    /// locations.
    pub fn push(&self, payload: &[u8]) -> (Location, Location) {
        let mut core = self.core.lock().unwrap();
        let start = core.next_push;
        core.write_buf.extend_from_slice(payload);
        core.next_push += payload.len() as u64;
        (start, core.next_push)
    }

    /// Declare bytes before `location` reclaimable.
    pub fn pop(&self, location: Location) {
        let mut core = self.core.lock().unwrap();
        let clamped = location.min(core.durable);
        if clamped > core.popped {
            core.popped = clamped;
        }
    }

    pub fn popped_location(&self) -> Location {
        self.core.lock().unwrap().popped
    }

    /// Make every previously pushed byte durable.
    pub async fn commit(&self) -> Result<()> {
        let mut file = self.file.lock().await;

        let (buf, start, popped, popped_moved) = {
            let mut core = self.core.lock().unwrap();
            let buf = core.write_buf.split().freeze();
            let start = core.buf_start;
            core.buf_start = core.next_push;
            (buf, start, core.popped, core.popped != core.header_popped)
        };

        if !buf.is_empty() {
            file.seek(SeekFrom::Start(HEADER_LEN + start)).await?;
            file.write_all(&buf).await?;
        }
        // The header is only rewritten when the reclaim watermark moved, so
        // a crash mid-rewrite can only ever lose pop progress.
        if popped_moved {
            write_header(&mut file, popped).await?;
        }
        file.sync_all().await?;

        {
            let mut core = self.core.lock().unwrap();
            core.durable = core.durable.max(start + buf.len() as u64);
            core.header_popped = core.header_popped.max(popped);
        }
        debug!(
            path = %self.path.display(),
            bytes = buf.len(),
            "disk queue commit"
        );
        Ok(())
    }

    /// Position the recovery cursor; returns true when there is nothing to
    /// replay.
    pub fn initialize_recovery(&self, min_location: Location) -> bool {
        let mut core = self.core.lock().unwrap();
        core.read_pos = min_location.max(core.popped);
        core.read_pos >= core.durable
    }

    /// Where the recovery cursor currently points.
    pub fn next_read_location(&self) -> Location {
        self.core.lock().unwrap().read_pos
    }

    /// Read up to `n` bytes at the recovery cursor. A short (possibly empty)
    /// result means the durable stream ended.
    pub async fn read_next(&self, n: usize) -> Result<Bytes> {
        let (pos, avail) = {
            let core = self.core.lock().unwrap();
            (core.read_pos, core.durable.saturating_sub(core.read_pos))
        };
        let take = (n as u64).min(avail) as usize;
        if take == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; take];
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(HEADER_LEN + pos)).await?;
            file.read_exact(&mut buf).await?;
        }
        self.core.lock().unwrap().read_pos = pos + take as u64;
        Ok(Bytes::from(buf))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An independent handle for positional reads of durable ranges.
    pub fn reader(&self) -> DiskQueueReader {
        DiskQueueReader {
            path: self.path.clone(),
        }
    }

    pub fn storage_bytes(&self) -> StorageBytes {
        let core = self.core.lock().unwrap();
        let used = (core.durable - core.popped) as i64;
        let free = (self.disk_budget - used).max(0);
        StorageBytes {
            free,
            total: self.disk_budget,
            used,
            available: free,
        }
    }
}

/// Positional reader over a queue file; safe to use concurrently with
/// appends because committed regions are never rewritten.
#[derive(Debug, Clone)]
pub struct DiskQueueReader {
    path: PathBuf,
}

impl DiskQueueReader {
    /// Read the durable bytes in `[start, end)`.
    pub async fn read(&self, start: Location, end: Location) -> Result<Bytes> {
        if end < start {
            return Err(Error::CorruptRecord(format!(
                "inverted read range {start}..{end}"
            )));
        }
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(HEADER_LEN + start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await.map_err(|e| {
            warn!(path = %self.path.display(), start, end, "short queue read");
            Error::Io(e)
        })?;
        Ok(Bytes::from(buf))
    }
}

async fn write_header(file: &mut File, popped: Location) -> Result<()> {
    let mut header = [0u8; 24];
    header[..8].copy_from_slice(&MAGIC.to_le_bytes());
    header[8..12].copy_from_slice(&FORMAT.to_le_bytes());
    header[12..20].copy_from_slice(&popped.to_le_bytes());
    let crc = crc32fast::hash(&header[..20]);
    header[20..24].copy_from_slice(&crc.to_le_bytes());
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&header).await?;
    Ok(())
}

async fn read_header(file: &mut File) -> Result<Location> {
    let mut header = [0u8; 24];
    file.seek(SeekFrom::Start(0)).await?;
    file.read_exact(&mut header).await?;
    let magic = u64::from_le_bytes(header[..8].try_into().unwrap());
    if magic != MAGIC {
        return Err(Error::UnsupportedFormat(format!(
            "bad queue magic {magic:#x}"
        )));
    }
    let format = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if format != FORMAT {
        return Err(Error::UnsupportedFormat(format!(
            "unknown queue format {format}"
        )));
    }
    let crc = u32::from_le_bytes(header[20..24].try_into().unwrap());
    if crc != crc32fast::hash(&header[..20]) {
        return Err(Error::ChecksumFailed);
    }
    Ok(u64::from_le_bytes(header[12..20].try_into().unwrap()))
}
