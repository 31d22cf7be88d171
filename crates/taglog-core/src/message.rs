//! Commit-batch and peek-body framing.
//!
//! ## Commit batch
//!
//! A commit batch is the byte blob a coordinator ships for one version: an
//! ordered sequence of tagged messages. Each message is framed as:
//!
//! ```text
//! ┌────────────┬──────────────┬───────────┬──────────────┬─────────┐
//! │ Length     │ Subsequence  │ Tag count │ Tags         │ Payload │
//! │ (4 bytes)  │ (4 bytes)    │ (2 bytes) │ (3 bytes ea) │ (rest)  │
//! └────────────┴──────────────┴───────────┴──────────────┴─────────┘
//! ```
//!
//! `Length` counts everything after itself. All integers are little-endian;
//! a tag is `i8` locality followed by `u16` id. Subsequences are assigned
//! monotonically within one batch so replicas can totally order messages
//! that share a version.
//!
//! ## Peek body
//!
//! A peek reply concatenates, for every version that contributes data:
//!
//! ```text
//! i32(-1) · u64(version) · message · message · ...
//! ```
//!
//! where each message reuses the commit-batch frame above. The `-1` marker
//! can never begin a message frame (a message length is at least 6), which
//! is what lets readers find version boundaries without a count field.
//!
//! ## Exec operations
//!
//! Operator snapshot coordination rides inside commit batches as messages
//! whose payload starts with the `XOP1` magic. [`ExecOp`] frames those.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::tag::Tag;
use crate::types::{Uid, Version};

/// Marker that introduces a version header inside a peek body.
pub const VERSION_HEADER_MARKER: i32 = -1;

/// Fixed bytes of a message frame after the length field, before the tags.
const MESSAGE_FIXED_BYTES: usize = 4 + 2;

/// One decoded message from a commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// The entire frame including the length prefix. Appending this to a
    /// peek body reproduces the message bit-exactly.
    pub raw: Bytes,
    pub subsequence: u32,
    pub tags: Vec<Tag>,
    pub payload: Bytes,
}

impl MessageRef {
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }
}

/// Builds the byte blob for one version's commit batch.
#[derive(Debug, Default)]
pub struct CommitBatchBuilder {
    buf: BytesMut,
    next_subsequence: u32,
}

impl CommitBatchBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            next_subsequence: 1,
        }
    }

    /// Append a tagged message; the subsequence is assigned automatically.
    pub fn append(&mut self, tags: &[Tag], payload: &[u8]) -> u32 {
        let subsequence = self.next_subsequence;
        self.next_subsequence += 1;
        let len = MESSAGE_FIXED_BYTES + tags.len() * Tag::WIRE_BYTES + payload.len();
        self.buf.reserve(4 + len);
        self.buf.put_u32_le(len as u32);
        self.buf.put_u32_le(subsequence);
        self.buf.put_u16_le(tags.len() as u16);
        for tag in tags {
            self.buf.put_i8(tag.locality);
            self.buf.put_u16_le(tag.id);
        }
        self.buf.put_slice(payload);
        subsequence
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Streaming decoder over a commit batch blob.
pub struct CommitBatchReader {
    rest: Bytes,
}

impl CommitBatchReader {
    pub fn new(batch: Bytes) -> Self {
        Self { rest: batch }
    }

    fn next_message(&mut self) -> Result<Option<MessageRef>> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        if self.rest.len() < 4 {
            return Err(Error::Truncated {
                needed: 4,
                have: self.rest.len(),
            });
        }
        let len = (&self.rest[..4]).get_u32_le() as usize;
        if len < MESSAGE_FIXED_BYTES {
            return Err(Error::BadMessageLength { length: len as u32 });
        }
        if self.rest.len() < 4 + len {
            return Err(Error::Truncated {
                needed: 4 + len,
                have: self.rest.len(),
            });
        }
        let raw = self.rest.slice(..4 + len);
        let mut body = self.rest.slice(4..4 + len);
        self.rest.advance(4 + len);

        let subsequence = body.get_u32_le();
        let tag_count = body.get_u16_le() as usize;
        let tags_bytes = tag_count * Tag::WIRE_BYTES;
        if body.len() < tags_bytes {
            return Err(Error::Truncated {
                needed: tags_bytes,
                have: body.len(),
            });
        }
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let locality = body.get_i8();
            let id = body.get_u16_le();
            tags.push(Tag { locality, id });
        }
        Ok(Some(MessageRef {
            raw,
            subsequence,
            tags,
            payload: body,
        }))
    }
}

impl Iterator for CommitBatchReader {
    type Item = Result<MessageRef>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

/// Builds a peek reply body: version headers followed by raw message frames.
#[derive(Debug, Default)]
pub struct PeekBodyBuilder {
    buf: BytesMut,
}

impl PeekBodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new version section. Callers must emit versions in ascending
    /// order and only for versions that contribute at least one message.
    pub fn begin_version(&mut self, version: Version) {
        self.buf.put_i32_le(VERSION_HEADER_MARKER);
        self.buf.put_u64_le(version);
    }

    /// Append an already-framed message (a `MessageRef::raw` or a slice held
    /// by the in-memory tag log).
    pub fn append_message(&mut self, raw: &[u8]) {
        self.buf.put_slice(raw);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Decoder over a peek body, yielding `(version, message)` pairs.
pub struct PeekBodyReader {
    rest: Bytes,
    current_version: Option<Version>,
}

impl PeekBodyReader {
    pub fn new(body: Bytes) -> Self {
        Self {
            rest: body,
            current_version: None,
        }
    }

    fn next_entry(&mut self) -> Result<Option<(Version, MessageRef)>> {
        loop {
            if self.rest.is_empty() {
                return Ok(None);
            }
            if self.rest.len() < 4 {
                return Err(Error::Truncated {
                    needed: 4,
                    have: self.rest.len(),
                });
            }
            let marker = (&self.rest[..4]).get_i32_le();
            if marker == VERSION_HEADER_MARKER {
                if self.rest.len() < 12 {
                    return Err(Error::Truncated {
                        needed: 12,
                        have: self.rest.len(),
                    });
                }
                self.rest.advance(4);
                let version = self.rest.get_u64_le();
                self.current_version = Some(version);
                continue;
            }
            let version = match self.current_version {
                Some(v) => v,
                None => return Err(Error::BadVersionHeader(marker)),
            };
            let mut reader = CommitBatchReader::new(self.rest.clone());
            let message = match reader.next_message()? {
                Some(m) => m,
                None => return Ok(None),
            };
            self.rest = reader.rest;
            return Ok(Some((version, message)));
        }
    }
}

impl Iterator for PeekBodyReader {
    type Item = Result<(Version, MessageRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

const EXEC_OP_MAGIC: &[u8; 4] = b"XOP1";

/// Operator snapshot coordination command carried in a commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOp {
    /// Defer all pops until `enable_pop` or until the deadline passes.
    DisablePop { uid: Uid, deadline_ms: u64 },
    /// Re-enable pops and replay everything deferred.
    EnablePop { uid: Uid },
    /// Run the external snapshot helper.
    Snap { uid: Uid },
}

impl ExecOp {
    /// True if this payload carries an exec op.
    pub fn is_exec_payload(payload: &[u8]) -> bool {
        payload.len() >= EXEC_OP_MAGIC.len() && &payload[..4] == EXEC_OP_MAGIC
    }

    pub fn uid(&self) -> Uid {
        match self {
            ExecOp::DisablePop { uid, .. } | ExecOp::EnablePop { uid } | ExecOp::Snap { uid } => {
                *uid
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 1 + 16 + 8);
        buf.put_slice(EXEC_OP_MAGIC);
        match self {
            ExecOp::DisablePop { uid, deadline_ms } => {
                buf.put_u8(1);
                buf.put_slice(&uid.to_bytes());
                buf.put_u64_le(*deadline_ms);
            }
            ExecOp::EnablePop { uid } => {
                buf.put_u8(2);
                buf.put_slice(&uid.to_bytes());
            }
            ExecOp::Snap { uid } => {
                buf.put_u8(3);
                buf.put_slice(&uid.to_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if !Self::is_exec_payload(payload) {
            return Err(Error::BadExecMagic);
        }
        let mut buf = &payload[4..];
        if buf.remaining() < 1 + 16 {
            return Err(Error::Truncated {
                needed: 17,
                have: buf.remaining(),
            });
        }
        let kind = buf.get_u8();
        let mut uid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uid_bytes);
        let uid = Uid::from_bytes(uid_bytes);
        match kind {
            1 => {
                if buf.remaining() < 8 {
                    return Err(Error::Truncated {
                        needed: 8,
                        have: buf.remaining(),
                    });
                }
                Ok(ExecOp::DisablePop {
                    uid,
                    deadline_ms: buf.get_u64_le(),
                })
            }
            2 => Ok(ExecOp::EnablePop { uid }),
            3 => Ok(ExecOp::Snap { uid }),
            other => Err(Error::UnknownExecKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(locality: i8, id: u16) -> Tag {
        Tag::new(locality, id)
    }

    // ---------------------------------------------------------------
    // Commit batch round trip
    // ---------------------------------------------------------------

    #[test]
    fn test_commit_batch_roundtrip() {
        let mut builder = CommitBatchBuilder::new();
        builder.append(&[tag(0, 7)], b"a");
        builder.append(&[tag(0, 7), tag(1, 3)], b"bb");
        builder.append(&[], b"");
        let batch = builder.finish();

        let messages: Vec<MessageRef> = CommitBatchReader::new(batch)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].subsequence, 1);
        assert_eq!(messages[0].tags, vec![tag(0, 7)]);
        assert_eq!(messages[0].payload, Bytes::from_static(b"a"));
        assert_eq!(messages[1].subsequence, 2);
        assert_eq!(messages[1].tags, vec![tag(0, 7), tag(1, 3)]);
        assert_eq!(messages[2].subsequence, 3);
        assert!(messages[2].tags.is_empty());
        assert!(messages[2].payload.is_empty());
    }

    #[test]
    fn test_commit_batch_raw_reproduces_frame() {
        let mut builder = CommitBatchBuilder::new();
        builder.append(&[tag(-1, 1)], b"txs-bytes");
        let batch = builder.finish();
        let message = CommitBatchReader::new(batch.clone())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(message.raw, batch);
    }

    #[test]
    fn test_commit_batch_empty_is_empty() {
        let batch = CommitBatchBuilder::new().finish();
        assert!(batch.is_empty());
        assert!(CommitBatchReader::new(batch).next().is_none());
    }

    #[test]
    fn test_commit_batch_truncated_fails() {
        let mut builder = CommitBatchBuilder::new();
        builder.append(&[tag(0, 1)], b"payload");
        let batch = builder.finish();
        let torn = batch.slice(..batch.len() - 2);
        let result: Result<Vec<MessageRef>> = CommitBatchReader::new(torn).collect();
        assert!(matches!(result, Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_commit_batch_bad_length_fails() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2); // smaller than the fixed header
        buf.put_slice(&[0, 0]);
        let result: Result<Vec<MessageRef>> = CommitBatchReader::new(buf.freeze()).collect();
        assert!(matches!(result, Err(Error::BadMessageLength { .. })));
    }

    #[test]
    fn test_subsequences_are_monotonic() {
        let mut builder = CommitBatchBuilder::new();
        for i in 0..10u32 {
            assert_eq!(builder.append(&[tag(0, 0)], b"x"), i + 1);
        }
    }

    // ---------------------------------------------------------------
    // Peek body
    // ---------------------------------------------------------------

    #[test]
    fn test_peek_body_roundtrip() {
        let mut batch = CommitBatchBuilder::new();
        batch.append(&[tag(0, 7)], b"a");
        batch.append(&[tag(0, 7)], b"b");
        let batch = batch.finish();
        let messages: Vec<MessageRef> = CommitBatchReader::new(batch)
            .collect::<Result<_>>()
            .unwrap();

        let mut body = PeekBodyBuilder::new();
        body.begin_version(10);
        body.append_message(&messages[0].raw);
        body.begin_version(11);
        body.append_message(&messages[1].raw);
        let body = body.finish();

        let decoded: Vec<(Version, MessageRef)> = PeekBodyReader::new(body)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, 10);
        assert_eq!(decoded[0].1.payload, Bytes::from_static(b"a"));
        assert_eq!(decoded[1].0, 11);
        assert_eq!(decoded[1].1.payload, Bytes::from_static(b"b"));
    }

    #[test]
    fn test_peek_body_multiple_messages_per_version() {
        let mut batch = CommitBatchBuilder::new();
        batch.append(&[tag(0, 1)], b"one");
        batch.append(&[tag(0, 1)], b"two");
        let messages: Vec<MessageRef> = CommitBatchReader::new(batch.finish())
            .collect::<Result<_>>()
            .unwrap();

        let mut body = PeekBodyBuilder::new();
        body.begin_version(5);
        for m in &messages {
            body.append_message(&m.raw);
        }
        let decoded: Vec<(Version, MessageRef)> = PeekBodyReader::new(body.finish())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|(v, _)| *v == 5));
    }

    #[test]
    fn test_peek_body_message_before_header_fails() {
        let mut batch = CommitBatchBuilder::new();
        batch.append(&[tag(0, 1)], b"x");
        let result: Result<Vec<_>> = PeekBodyReader::new(batch.finish()).collect();
        assert!(matches!(result, Err(Error::BadVersionHeader(_))));
    }

    #[test]
    fn test_peek_body_empty() {
        assert!(PeekBodyReader::new(Bytes::new()).next().is_none());
    }

    // ---------------------------------------------------------------
    // Exec ops
    // ---------------------------------------------------------------

    #[test]
    fn test_exec_op_roundtrip() {
        let uid = Uid::new(7, 9);
        for op in [
            ExecOp::DisablePop {
                uid,
                deadline_ms: 123_456,
            },
            ExecOp::EnablePop { uid },
            ExecOp::Snap { uid },
        ] {
            let encoded = op.encode();
            assert!(ExecOp::is_exec_payload(&encoded));
            assert_eq!(ExecOp::decode(&encoded).unwrap(), op);
        }
    }

    #[test]
    fn test_exec_op_rejects_plain_payload() {
        assert!(!ExecOp::is_exec_payload(b"ordinary mutation"));
        assert!(matches!(
            ExecOp::decode(b"ordinary mutation"),
            Err(Error::BadExecMagic)
        ));
    }

    #[test]
    fn test_exec_op_unknown_kind() {
        let mut encoded = BytesMut::new();
        encoded.put_slice(b"XOP1");
        encoded.put_u8(9);
        encoded.put_slice(&[0u8; 16]);
        assert!(matches!(
            ExecOp::decode(&encoded),
            Err(Error::UnknownExecKind(9))
        ));
    }
}
