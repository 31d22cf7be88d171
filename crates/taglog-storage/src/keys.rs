//! Persistent key namespace.
//!
//! Byte-literal key layout of the KV index. All per-generation keys embed
//! the 16-byte big-endian generation id; tag-scoped keys append a 3-byte
//! tag (locality byte, then big-endian id) and, where present, a big-endian
//! version so that a range scan walks versions in ascending order.

use bytes::{Buf, Bytes};
use taglog_core::{Tag, Uid, Version};

pub const FORMAT_KEY: &[u8] = b"Format";
/// The only accepted format value; anything else fails recovery.
pub const FORMAT_VALUE: &[u8] = b"FoundationDB/LogServer/3/0";

pub const RECOVERY_LOCATION_KEY: &[u8] = b"recoveryLocation";

pub const VERSION_PREFIX: &[u8] = b"version/";
pub const KNOWN_COMMITTED_PREFIX: &[u8] = b"knownCommitted/";
pub const LOCALITY_PREFIX: &[u8] = b"Locality/";
pub const LOG_ROUTER_TAGS_PREFIX: &[u8] = b"LogRouterTags/";
pub const RECOVERY_COUNT_PREFIX: &[u8] = b"DbRecoveryCount/";
pub const PROTOCOL_VERSION_PREFIX: &[u8] = b"ProtocolVersion/";
pub const TAG_MSG_PREFIX: &[u8] = b"TagMsg/";
pub const TAG_MSG_REF_PREFIX: &[u8] = b"TagMsgRef/";
pub const TAG_POP_PREFIX: &[u8] = b"TagPop/";

/// `prefix + generation id`.
pub fn gen_key(prefix: &[u8], id: Uid) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&id.to_bytes());
    key
}

fn push_tag(key: &mut Vec<u8>, tag: Tag) {
    key.push(tag.locality as u8);
    key.extend_from_slice(&tag.id.to_be_bytes());
}

/// `prefix + generation id + tag`.
pub fn tag_key(prefix: &[u8], id: Uid, tag: Tag) -> Vec<u8> {
    let mut key = gen_key(prefix, id);
    push_tag(&mut key, tag);
    key
}

/// `prefix + generation id + tag + big-endian version`.
pub fn tag_version_key(prefix: &[u8], id: Uid, tag: Tag, version: Version) -> Vec<u8> {
    let mut key = tag_key(prefix, id, tag);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Parse the trailing big-endian version off a `tag_version_key`.
pub fn parse_tag_version_key(prefix: &[u8], key: &[u8]) -> Option<(Uid, Tag, Version)> {
    let rest = key.strip_prefix(prefix)?;
    if rest.len() != 16 + 3 + 8 {
        return None;
    }
    let mut uid = [0u8; 16];
    uid.copy_from_slice(&rest[..16]);
    let tag = Tag::new(rest[16] as i8, u16::from_be_bytes([rest[17], rest[18]]));
    let mut ver = [0u8; 8];
    ver.copy_from_slice(&rest[19..]);
    Some((Uid::from_bytes(uid), tag, u64::from_be_bytes(ver)))
}

/// Smallest byte string strictly greater than every string with this
/// prefix. Empty result means "no upper bound".
pub fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return out;
        }
        out.pop();
    }
    out
}

/// `[begin, end)` covering exactly the keys with this prefix.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (prefix.to_vec(), strinc(prefix))
}

pub fn encode_u64(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn decode_u64(mut value: Bytes) -> Option<u64> {
    if value.len() != 8 {
        return None;
    }
    Some(value.get_u64_le())
}
