//! 128-bit Unique Identifiers
//!
//! Log instances, recruitments, and peek peers are identified by a random
//! 128-bit `Uid`. Uids are ordered and hashable so they can serve as map
//! keys, and they have two encodings:
//!
//! - **wire**: two little-endian `u64`s (matches the rest of the wire layer)
//! - **durable keys**: 16 big-endian bytes, so that keys sharing a uid prefix
//!   sort contiguously in the index store

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Encoded size of a uid in both encodings.
pub const UID_ENCODED_LEN: usize = 16;

/// A random 128-bit identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Uid(pub u64, pub u64);

impl Uid {
    /// Mint a fresh random uid.
    pub fn random() -> Self {
        let bits = uuid::Uuid::new_v4().as_u128();
        Uid((bits >> 64) as u64, bits as u64)
    }

    pub const fn new(first: u64, second: u64) -> Self {
        Uid(first, second)
    }

    /// The high 64 bits, used where a 64-bit instance id is sufficient.
    pub fn first(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0 || self.1 != 0
    }

    /// Big-endian key encoding: uids sort the same as their key bytes.
    pub fn to_key_bytes(&self) -> [u8; UID_ENCODED_LEN] {
        let mut out = [0u8; UID_ENCODED_LEN];
        out[..8].copy_from_slice(&self.0.to_be_bytes());
        out[8..].copy_from_slice(&self.1.to_be_bytes());
        out
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < UID_ENCODED_LEN {
            return Err(Error::CorruptRecord("truncated uid key".into()));
        }
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..16]);
        Ok(Uid(u64::from_be_bytes(a), u64::from_be_bytes(b)))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.0);
        buf.put_u64_le(self.1);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < UID_ENCODED_LEN {
            return Err(Error::CorruptRecord("truncated uid".into()));
        }
        Ok(Uid(buf.get_u64_le(), buf.get_u64_le()))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: high 64 bits, like a git short hash.
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_random_uids_are_distinct() {
        let a = Uid::random();
        let b = Uid::random();
        assert_ne!(a, b);
        assert!(a.is_valid());
    }

    #[test]
    fn test_wire_roundtrip() {
        let uid = Uid::new(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        let mut buf = BytesMut::new();
        uid.encode(&mut buf);
        assert_eq!(buf.len(), UID_ENCODED_LEN);
        assert_eq!(Uid::decode(&mut buf.freeze()).unwrap(), uid);
    }

    #[test]
    fn test_key_bytes_preserve_order() {
        let a = Uid::new(1, u64::MAX);
        let b = Uid::new(2, 0);
        assert!(a < b);
        assert!(a.to_key_bytes() < b.to_key_bytes());
        assert_eq!(Uid::from_key_bytes(&a.to_key_bytes()).unwrap(), a);
    }

    #[test]
    fn test_invalid_default() {
        assert!(!Uid::default().is_valid());
    }
}
