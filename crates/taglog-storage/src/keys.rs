//! Durable Index Key Layout
//!
//! Every key the engine writes into the index store, in one place. The
//! layout is versioned by the immutable `Format` key; a store written by an
//! unknown format is fatal at startup.
//!
//! ## Key Map
//!
//! ```text
//! Format                                   -> "FoundationDB/LogServer/3/0"
//! version/<BE log-id>                      -> i64 persistent data version
//! knownCommitted/<BE log-id>               -> i64
//! Locality/<BE log-id>                     -> i8
//! LogRouterTags/<BE log-id>                -> i32
//! DbRecoveryCount/<BE log-id>              -> u64
//! ProtocolVersion/<BE log-id>              -> u64
//! recoveryLocation                         -> u64 queue location
//! TagMsg/<BE log-id><tag><BE version>      -> raw message bytes   (txs, by value)
//! TagMsgRef/<BE log-id><tag><BE version>   -> u32 count | SpilledData...
//! TagPop/<BE log-id><tag>                  -> i64 popped
//! ```
//!
//! Versions inside keys are big-endian so that lexicographic key order is
//! version order; all values are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use taglog_core::tag::TAG_ENCODED_LEN;
use taglog_core::uid::UID_ENCODED_LEN;
use taglog_core::{Error, Result, Tag, Uid, Version};

use crate::disk_queue::Location;

pub const FORMAT_KEY: &[u8] = b"Format";
pub const FORMAT_VALUE: &[u8] = b"FoundationDB/LogServer/3/0";
/// Formats we can read: `[3/0, 4/0)`.
pub const FORMAT_READABLE_BEGIN: &[u8] = b"FoundationDB/LogServer/3/0";
pub const FORMAT_READABLE_END: &[u8] = b"FoundationDB/LogServer/4/0";

pub const CURRENT_VERSION_PREFIX: &[u8] = b"version/";
pub const KNOWN_COMMITTED_PREFIX: &[u8] = b"knownCommitted/";
pub const LOCALITY_PREFIX: &[u8] = b"Locality/";
pub const LOG_ROUTER_TAGS_PREFIX: &[u8] = b"LogRouterTags/";
pub const RECOVERY_COUNT_PREFIX: &[u8] = b"DbRecoveryCount/";
pub const PROTOCOL_VERSION_PREFIX: &[u8] = b"ProtocolVersion/";
pub const RECOVERY_LOCATION_KEY: &[u8] = b"recoveryLocation";
pub const TAG_MESSAGES_PREFIX: &[u8] = b"TagMsg/";
pub const TAG_MESSAGE_REFS_PREFIX: &[u8] = b"TagMsgRef/";
pub const TAG_POPPED_PREFIX: &[u8] = b"TagPop/";

/// `prefix + BE(log-id)`.
pub fn per_instance_key(prefix: &[u8], id: Uid) -> Bytes {
    let mut out = BytesMut::with_capacity(prefix.len() + UID_ENCODED_LEN);
    out.put_slice(prefix);
    out.put_slice(&id.to_key_bytes());
    out.freeze()
}

/// The exclusive end of the one-key range for `prefix + BE(log-id)`.
pub fn per_instance_key_end(prefix: &[u8], id: Uid) -> Bytes {
    strinc(&per_instance_key(prefix, id))
}

/// `[prefix, strinc(prefix))`: every per-instance key under `prefix`.
pub fn prefix_range(prefix: &[u8]) -> (Bytes, Bytes) {
    (Bytes::copy_from_slice(prefix), strinc(prefix))
}

fn tag_key(prefix: &[u8], id: Uid, tag: Tag, version: Option<Version>) -> Bytes {
    let mut out = BytesMut::with_capacity(prefix.len() + UID_ENCODED_LEN + TAG_ENCODED_LEN + 8);
    out.put_slice(prefix);
    out.put_slice(&id.to_key_bytes());
    tag.encode(&mut out);
    if let Some(v) = version {
        out.put_i64(v); // big-endian: key order is version order
    }
    out.freeze()
}

/// Key of a by-value spilled row (`TagMsg/`).
pub fn tag_messages_key(id: Uid, tag: Tag, version: Version) -> Bytes {
    tag_key(TAG_MESSAGES_PREFIX, id, tag, Some(version))
}

/// Key of a by-reference spilled batch (`TagMsgRef/`), keyed by the last
/// version in the batch.
pub fn tag_message_refs_key(id: Uid, tag: Tag, version: Version) -> Bytes {
    tag_key(TAG_MESSAGE_REFS_PREFIX, id, tag, Some(version))
}

pub fn tag_popped_key(id: Uid, tag: Tag) -> Bytes {
    tag_key(TAG_POPPED_PREFIX, id, tag, None)
}

/// Recover the version suffix of a `TagMsg/`/`TagMsgRef/` key.
pub fn decode_tag_key_version(prefix: &[u8], key: &[u8]) -> Result<Version> {
    let fixed = prefix.len() + UID_ENCODED_LEN + TAG_ENCODED_LEN;
    if key.len() != fixed + 8 {
        return Err(Error::CorruptRecord("bad spilled key length".into()));
    }
    let mut tail = &key[fixed..];
    Ok(tail.get_i64())
}

/// Recover the tag suffix of a `TagPop/` key.
pub fn decode_tag_popped_key(key: &[u8]) -> Result<Tag> {
    let fixed = TAG_POPPED_PREFIX.len() + UID_ENCODED_LEN;
    if key.len() != fixed + TAG_ENCODED_LEN {
        return Err(Error::CorruptRecord("bad popped key length".into()));
    }
    let mut tail = &key[fixed..];
    Tag::decode(&mut tail)
}

/// Recover the log id from a per-instance key.
pub fn decode_instance_id(prefix: &[u8], key: &[u8]) -> Result<Uid> {
    if key.len() < prefix.len() + UID_ENCODED_LEN {
        return Err(Error::CorruptRecord("bad per-instance key length".into()));
    }
    Uid::from_key_bytes(&key[prefix.len()..])
}

/// First key strictly after every key with this prefix: increment the last
/// byte that is not 0xff and truncate the rest.
pub fn strinc(prefix: &[u8]) -> Bytes {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() = last + 1;
            return Bytes::from(out);
        }
    }
    // All 0xff: no key is after this prefix; a single 0xff beyond any key we
    // ever write serves as +infinity.
    Bytes::from_static(&[0xff])
}

pub fn encode_version_value(v: Version) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

pub fn decode_version_value(value: &[u8]) -> Result<Version> {
    if value.len() < 8 {
        return Err(Error::CorruptRecord("short version value".into()));
    }
    Ok(i64::from_le_bytes(value[..8].try_into().unwrap()))
}

pub fn encode_location_value(loc: Location) -> Bytes {
    Bytes::copy_from_slice(&loc.to_le_bytes())
}

pub fn decode_location_value(value: &[u8]) -> Result<Location> {
    if value.len() < 8 {
        return Err(Error::CorruptRecord("short location value".into()));
    }
    Ok(u64::from_le_bytes(value[..8].try_into().unwrap()))
}

pub fn encode_u64_value(v: u64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

pub fn decode_u64_value(value: &[u8]) -> Result<u64> {
    if value.len() < 8 {
        return Err(Error::CorruptRecord("short u64 value".into()));
    }
    Ok(u64::from_le_bytes(value[..8].try_into().unwrap()))
}

pub fn encode_i32_value(v: i32) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

pub fn decode_i32_value(value: &[u8]) -> Result<i32> {
    if value.len() < 4 {
        return Err(Error::CorruptRecord("short i32 value".into()));
    }
    Ok(i32::from_le_bytes(value[..4].try_into().unwrap()))
}

pub fn encode_i8_value(v: i8) -> Bytes {
    Bytes::copy_from_slice(&[v as u8])
}

pub fn decode_i8_value(value: &[u8]) -> Result<i8> {
    value
        .first()
        .map(|b| *b as i8)
        .ok_or_else(|| Error::CorruptRecord("empty i8 value".into()))
}

/// One spilled-by-reference pointer: where a version's framed record lives
/// on the raw queue and how many mutation bytes it holds for the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpilledData {
    pub version: Version,
    pub start: Location,
    pub length: u32,
    pub mutation_bytes: u32,
}

pub const SPILLED_DATA_ENCODED_LEN: usize = 8 + 8 + 4 + 4;

impl SpilledData {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.version);
        buf.put_u64_le(self.start);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.mutation_bytes);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < SPILLED_DATA_ENCODED_LEN {
            return Err(Error::CorruptRecord("truncated spilled data".into()));
        }
        Ok(SpilledData {
            version: buf.get_i64_le(),
            start: buf.get_u64_le(),
            length: buf.get_u32_le(),
            mutation_bytes: buf.get_u32_le(),
        })
    }
}

/// Decode a `TagMsgRef/` value: `u32 count | count x SpilledData`.
pub fn decode_spilled_batch(value: &[u8]) -> Result<Vec<SpilledData>> {
    let mut buf = value;
    if buf.remaining() < 4 {
        return Err(Error::CorruptRecord("truncated spilled batch".into()));
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() != count * SPILLED_DATA_ENCODED_LEN {
        return Err(Error::CorruptRecord(format!(
            "spilled batch count {} does not match {} bytes",
            count,
            buf.remaining()
        )));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(SpilledData::decode(&mut buf)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_keys_sort_by_version() {
        let id = Uid::random();
        let t = Tag::new(0, 3);
        let k1 = tag_message_refs_key(id, t, 5);
        let k2 = tag_message_refs_key(id, t, 6);
        let k3 = tag_message_refs_key(id, t, 0x100);
        assert!(k1 < k2);
        assert!(k2 < k3);
        assert_eq!(
            decode_tag_key_version(TAG_MESSAGE_REFS_PREFIX, &k3).unwrap(),
            0x100
        );
    }

    #[test]
    fn test_popped_key_roundtrip() {
        let id = Uid::random();
        let t = Tag::new(2, 9);
        let key = tag_popped_key(id, t);
        assert_eq!(decode_tag_popped_key(&key).unwrap(), t);
        assert_eq!(decode_instance_id(TAG_POPPED_PREFIX, &key).unwrap(), id);
    }

    #[test]
    fn test_strinc() {
        assert_eq!(strinc(b"abc"), Bytes::from_static(b"abd"));
        assert_eq!(strinc(b"a\xff\xff"), Bytes::from_static(b"b"));
        assert_eq!(strinc(b"\xff"), Bytes::from_static(&[0xff]));
    }

    #[test]
    fn test_strinc_bounds_prefix_range() {
        let id = Uid::new(u64::MAX, u64::MAX);
        let key = per_instance_key(TAG_MESSAGES_PREFIX, id);
        let end = per_instance_key_end(TAG_MESSAGES_PREFIX, id);
        assert!(key < end);
        let with_tag = tag_messages_key(id, Tag::new(i8::MAX, u16::MAX), Version::MAX);
        assert!(with_tag < end);
    }

    #[test]
    fn test_spilled_batch_roundtrip() {
        let rows = vec![
            SpilledData {
                version: 10,
                start: 0,
                length: 64,
                mutation_bytes: 12,
            },
            SpilledData {
                version: 11,
                start: 64,
                length: 128,
                mutation_bytes: 80,
            },
        ];
        let mut buf = BytesMut::new();
        buf.put_u32_le(rows.len() as u32);
        for r in &rows {
            r.encode(&mut buf);
        }
        assert_eq!(decode_spilled_batch(&buf).unwrap(), rows);
    }

    #[test]
    fn test_spilled_batch_rejects_bad_count() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        SpilledData {
            version: 1,
            start: 0,
            length: 1,
            mutation_bytes: 1,
        }
        .encode(&mut buf);
        assert!(decode_spilled_batch(&buf).is_err());
    }

    #[test]
    fn test_version_value_roundtrip() {
        let v = encode_version_value(-7);
        assert_eq!(decode_version_value(&v).unwrap(), -7);
        let l = encode_location_value(u64::MAX - 3);
        assert_eq!(decode_location_value(&l).unwrap(), u64::MAX - 3);
    }
}
