//! Message Framing
//!
//! This module defines the two byte-exact framings used on the commit and
//! peek paths. Both are little-endian.
//!
//! ## Commit Payload Framing
//!
//! The `messages` field of a commit request concatenates framed messages:
//!
//! ```text
//! ┌──────────┬─────────────┬───────────┬──────────────────┬─────────┐
//! │ length   │ subsequence │ tag count │ tags             │ payload │
//! │ (u32)    │ (u32)       │ (u16)     │ (3 bytes each)   │ (bytes) │
//! └──────────┴─────────────┴───────────┴──────────────────┴─────────┘
//! ```
//!
//! `length` covers everything from `subsequence` through the end of
//! `payload`. `subsequence` orders messages within a version. A "framed
//! message" always means the whole record including its own length prefix;
//! the per-tag index stores framed messages so that peek replies can emit
//! them without re-encoding.
//!
//! ## Peek Reply Framing
//!
//! A peek reply concatenates per-version groups:
//!
//! ```text
//! i32(-1) | i64 version | framed message | framed message | ...
//! ```
//!
//! The `-1` sentinel cannot collide with a message length prefix (lengths are
//! always >= 6), so a consumer can split a reply on `-1` markers and recover
//! per-version message groups. Relative order within a version is preserved.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::tag::{Tag, TAG_ENCODED_LEN};
use crate::Version;

/// Sentinel introducing a version group in a peek reply.
pub const VERSION_GROUP_HEADER: i32 = -1;

/// Bytes of a framed message that precede the payload, beyond the tags.
const MESSAGE_HEADER_LEN: usize = 4 + 4 + 2; // length + subsequence + tag count

/// A single framed message plus its decoded tag set.
///
/// `framed` is the complete record including the length prefix, sliced
/// zero-copy out of the commit blob it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    pub tags: Vec<Tag>,
    pub framed: Bytes,
}

impl TaggedMessage {
    /// The length-prefix value: bytes from subsequence through payload end.
    pub fn expected_size(&self) -> usize {
        self.framed.len() - 4
    }

    pub fn subsequence(&self) -> u32 {
        let mut b = &self.framed[4..8];
        b.get_u32_le()
    }

    /// The opaque payload bytes (after the tag list).
    pub fn payload(&self) -> Bytes {
        let skip = MESSAGE_HEADER_LEN + self.tags.len() * TAG_ENCODED_LEN;
        self.framed.slice(skip..)
    }
}

/// Builds a commit `messages` blob from individual messages.
#[derive(Debug, Default)]
pub struct MessageSetBuilder {
    buf: BytesMut,
}

impl MessageSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subsequence: u32, tags: &[Tag], payload: &[u8]) -> &mut Self {
        let length = 4 + 2 + tags.len() * TAG_ENCODED_LEN + payload.len();
        self.buf.put_u32_le(length as u32);
        self.buf.put_u32_le(subsequence);
        self.buf.put_u16_le(tags.len() as u16);
        for tag in tags {
            tag.encode(&mut self.buf);
        }
        self.buf.put_slice(payload);
        self
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Parse a commit blob into its framed messages, zero-copy.
pub fn parse_messages(blob: &Bytes) -> Result<Vec<TaggedMessage>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < blob.len() {
        let (msg, next) = parse_one(blob, pos)?;
        out.push(msg);
        pos = next;
    }
    Ok(out)
}

fn parse_one(blob: &Bytes, pos: usize) -> Result<(TaggedMessage, usize)> {
    let rest = &blob[pos..];
    if rest.len() < MESSAGE_HEADER_LEN {
        return Err(Error::CorruptRecord("truncated message header".into()));
    }
    let mut rd = rest;
    let length = rd.get_u32_le() as usize;
    let _subsequence = rd.get_u32_le();
    let tag_count = rd.get_u16_le() as usize;
    let framed_len = length + 4;
    if length < 4 + 2 + tag_count * TAG_ENCODED_LEN || rest.len() < framed_len {
        return Err(Error::CorruptRecord(format!(
            "message length {} exceeds blob ({} remaining)",
            length,
            rest.len()
        )));
    }
    let mut tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        tags.push(Tag::decode(&mut rd)?);
    }
    let framed = blob.slice(pos..pos + framed_len);
    Ok((TaggedMessage { tags, framed }, pos + framed_len))
}

/// Return the framed messages in `blob` whose tag set includes `tag`.
///
/// Log-router tags match modulo `log_router_tags`: a message tagged with a
/// router id from an earlier configuration still reaches the router that now
/// owns `id % log_router_tags`.
pub fn filter_for_tag(blob: &Bytes, tag: Tag, log_router_tags: i32) -> Result<Vec<Bytes>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < blob.len() {
        let (msg, next) = parse_one(blob, pos)?;
        let matched = msg.tags.iter().any(|t| {
            *t == tag
                || (tag.is_log_router()
                    && t.is_log_router()
                    && log_router_tags > 0
                    && t.id as i32 % log_router_tags == tag.id as i32)
        });
        if matched {
            out.push(msg.framed);
        }
        pos = next;
    }
    Ok(out)
}

/// Write the `i32(-1) | i64 version` group header into a peek reply buffer.
pub fn put_version_group_header(buf: &mut impl BufMut, version: Version) {
    buf.put_i32_le(VERSION_GROUP_HEADER);
    buf.put_i64_le(version);
}

/// Decodes a peek reply into `(version, framed messages)` groups.
pub struct PeekGroupIter {
    buf: Bytes,
}

impl PeekGroupIter {
    pub fn new(reply_messages: Bytes) -> Self {
        Self {
            buf: reply_messages,
        }
    }
}

impl Iterator for PeekGroupIter {
    type Item = Result<(Version, Vec<Bytes>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < 12 {
            return Some(Err(Error::CorruptRecord("truncated group header".into())));
        }
        let marker = (&self.buf[..4]).get_i32_le();
        if marker != VERSION_GROUP_HEADER {
            return Some(Err(Error::CorruptRecord(format!(
                "expected group header, found {marker}"
            ))));
        }
        let version = (&self.buf[4..12]).get_i64_le();
        self.buf.advance(12);

        let mut messages = Vec::new();
        while self.buf.len() >= 4 {
            let next = (&self.buf[..4]).get_i32_le();
            if next == VERSION_GROUP_HEADER {
                break;
            }
            match parse_one(&self.buf, 0) {
                Ok((msg, consumed)) => {
                    messages.push(msg.framed);
                    self.buf.advance(consumed);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok((version, messages)))
    }
}

/// A commit's message bytes, either pre-serialized (the proxy path) or
/// structured (internally generated batches).
///
/// The persistent queue always stores the raw form; the structured variant
/// serializes on demand and recomputes its size.
#[derive(Debug, Clone)]
pub enum CommitPayload {
    Raw(Bytes),
    Structured(Vec<TaggedMessage>),
}

impl CommitPayload {
    pub fn empty() -> Self {
        CommitPayload::Raw(Bytes::new())
    }

    pub fn to_raw(&self) -> Bytes {
        match self {
            CommitPayload::Raw(b) => b.clone(),
            CommitPayload::Structured(msgs) => {
                let total = msgs.iter().map(|m| m.framed.len()).sum();
                let mut buf = BytesMut::with_capacity(total);
                for m in msgs {
                    buf.put_slice(&m.framed);
                }
                buf.freeze()
            }
        }
    }

    pub fn expected_size(&self) -> usize {
        match self {
            CommitPayload::Raw(b) => b.len(),
            CommitPayload::Structured(msgs) => msgs.iter().map(|m| m.framed.len()).sum(),
        }
    }

    pub fn parse(&self) -> Result<Vec<TaggedMessage>> {
        match self {
            CommitPayload::Raw(b) => parse_messages(b),
            CommitPayload::Structured(msgs) => Ok(msgs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::LOCALITY_LOG_ROUTER;

    fn sample_blob() -> Bytes {
        let mut b = MessageSetBuilder::new();
        b.push(1, &[Tag::new(0, 1)], b"alpha");
        b.push(2, &[Tag::new(0, 1), Tag::new(0, 2)], b"beta");
        b.push(3, &[Tag::TXS], b"\xff/sys");
        b.build()
    }

    #[test]
    fn test_build_parse_roundtrip() {
        let blob = sample_blob();
        let msgs = parse_messages(&blob).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].subsequence(), 1);
        assert_eq!(msgs[0].tags, vec![Tag::new(0, 1)]);
        assert_eq!(msgs[0].payload(), Bytes::from_static(b"alpha"));
        assert_eq!(msgs[1].tags.len(), 2);
        assert_eq!(msgs[2].tags, vec![Tag::TXS]);
        // Length prefix covers subsequence..payload.
        assert_eq!(msgs[0].expected_size(), 4 + 2 + 3 + 5);
    }

    #[test]
    fn test_framed_slices_are_contiguous() {
        let blob = sample_blob();
        let msgs = parse_messages(&blob).unwrap();
        let total: usize = msgs.iter().map(|m| m.framed.len()).sum();
        assert_eq!(total, blob.len());
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let blob = sample_blob();
        let cut = blob.slice(..blob.len() - 1);
        assert!(parse_messages(&cut).is_err());
        let cut = blob.slice(..3);
        assert!(parse_messages(&cut).is_err());
    }

    #[test]
    fn test_filter_for_tag() {
        let blob = sample_blob();
        let hits = filter_for_tag(&blob, Tag::new(0, 1), 0).unwrap();
        assert_eq!(hits.len(), 2);
        let hits = filter_for_tag(&blob, Tag::new(0, 2), 0).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = filter_for_tag(&blob, Tag::new(0, 9), 0).unwrap();
        assert!(hits.is_empty());
        let hits = filter_for_tag(&blob, Tag::TXS, 0).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_filter_log_router_modulo() {
        let mut b = MessageSetBuilder::new();
        b.push(1, &[Tag::new(LOCALITY_LOG_ROUTER, 5)], b"routed");
        let blob = b.build();
        // 5 % 2 == 1, so router 1 of 2 owns this message.
        let hits = filter_for_tag(&blob, Tag::new(LOCALITY_LOG_ROUTER, 1), 2).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = filter_for_tag(&blob, Tag::new(LOCALITY_LOG_ROUTER, 0), 2).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_peek_group_framing() {
        let blob = sample_blob();
        let msgs = parse_messages(&blob).unwrap();

        let mut reply = BytesMut::new();
        put_version_group_header(&mut reply, 10);
        reply.put_slice(&msgs[0].framed);
        reply.put_slice(&msgs[1].framed);
        put_version_group_header(&mut reply, 12);
        reply.put_slice(&msgs[2].framed);

        let groups: Vec<_> = PeekGroupIter::new(reply.freeze())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, 10);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, 12);
        assert_eq!(groups[1].1, vec![msgs[2].framed.clone()]);
    }

    #[test]
    fn test_commit_payload_raw_vs_structured() {
        let blob = sample_blob();
        let structured = CommitPayload::Structured(parse_messages(&blob).unwrap());
        assert_eq!(structured.to_raw(), blob);
        assert_eq!(structured.expected_size(), blob.len());
        assert_eq!(CommitPayload::Raw(blob.clone()).expected_size(), blob.len());
        assert_eq!(CommitPayload::empty().expected_size(), 0);
    }
}
