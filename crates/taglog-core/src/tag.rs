//! Tags - Message Routing Identifiers
//!
//! A `Tag` selects which consumer(s) a message is delivered to. Every message
//! in a commit carries a set of tags; a log instance indexes each message
//! under every tag it hosts, and consumers peek the stream filtered by one
//! tag.
//!
//! ## Structure
//!
//! A tag is `(locality: i8, id: u16)`:
//! - Non-negative localities identify a region; a log instance hosts a tag
//!   when the tag's locality matches its own (or is negative).
//! - Negative localities are reserved classes: the log-router locality, the
//!   system-transaction locality, and a few lifecycle markers.
//!
//! ## The System-Transaction Tag
//!
//! `Tag::TXS` is special throughout the storage engine: it is spilled by
//! value (full message bytes into the index store) instead of by reference,
//! its popped location is never tracked, and it is peeked by value during
//! recovery. Callers never need to handle this specially; the engine does.
//!
//! ## Wire Encoding
//!
//! 3 bytes: `i8 locality | u16le id`.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Locality of tags that every instance hosts regardless of its own locality.
pub const LOCALITY_SPECIAL: i8 = -1;
/// Locality of log-router tags (ids are reduced modulo the router count).
pub const LOCALITY_LOG_ROUTER: i8 = -2;
/// Locality of remote-log tags.
pub const LOCALITY_REMOTE_LOG: i8 = -3;
/// Locality marker for tags carried across an upgrade.
pub const LOCALITY_UPGRADED: i8 = -4;
/// Locality of satellite instances (host only txs and log-router tags).
pub const LOCALITY_SATELLITE: i8 = -5;
/// Locality of an uninitialized instance.
pub const LOCALITY_INVALID: i8 = -99;

/// Encoded size of a tag on the wire and in durable keys.
pub const TAG_ENCODED_LEN: usize = 3;

/// A message routing identifier: `(locality, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub locality: i8,
    pub id: u16,
}

impl Tag {
    /// The reserved system-transaction tag, spilled by value.
    pub const TXS: Tag = Tag {
        locality: LOCALITY_SPECIAL,
        id: 1,
    };

    pub const fn new(locality: i8, id: u16) -> Self {
        Tag { locality, id }
    }

    /// True if this is a log-router tag (id aliases modulo the router count).
    pub fn is_log_router(&self) -> bool {
        self.locality == LOCALITY_LOG_ROUTER
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i8(self.locality);
        buf.put_u16_le(self.id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < TAG_ENCODED_LEN {
            return Err(Error::CorruptRecord("truncated tag".into()));
        }
        let locality = buf.get_i8();
        let id = buf.get_u16_le();
        Ok(Tag { locality, id })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locality, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_encode_decode_roundtrip() {
        for tag in [
            Tag::new(0, 0),
            Tag::new(0, 7),
            Tag::new(3, u16::MAX),
            Tag::TXS,
            Tag::new(LOCALITY_LOG_ROUTER, 2),
            Tag::new(LOCALITY_SATELLITE, 0),
        ] {
            let mut buf = BytesMut::new();
            tag.encode(&mut buf);
            assert_eq!(buf.len(), TAG_ENCODED_LEN);
            let decoded = Tag::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded, tag);
        }
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = bytes::Bytes::from_static(&[0, 1]);
        assert!(Tag::decode(&mut buf).is_err());
    }

    #[test]
    fn test_txs_tag_identity() {
        assert_eq!(Tag::TXS.locality, LOCALITY_SPECIAL);
        assert_eq!(Tag::TXS.id, 1);
        assert!(!Tag::TXS.is_log_router());
        assert!(Tag::new(LOCALITY_LOG_ROUTER, 5).is_log_router());
    }

    #[test]
    fn test_ordering_is_locality_then_id() {
        let a = Tag::new(0, 9);
        let b = Tag::new(1, 0);
        assert!(a < b);
        assert!(Tag::new(0, 1) < Tag::new(0, 2));
    }

    #[test]
    fn test_display() {
        assert_eq!(Tag::new(0, 2).to_string(), "0:2");
        assert_eq!(Tag::TXS.to_string(), "-1:1");
    }

    #[test]
    fn test_serde_roundtrip() {
        let tag = Tag::new(LOCALITY_LOG_ROUTER, 7);
        let json = serde_json::to_string(&tag).unwrap();
        let back: Tag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);
    }
}
