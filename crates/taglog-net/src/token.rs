//! Endpoint tokens.
//!
//! A token is 128 bits: a random `first` word that makes tokens
//! unguessable and detects stale slab slots, and a structured `second`
//! word:
//!
//! ```text
//!  bit 63        bits 62..32          bits 31..0
//! ┌────────┬─────────────────────┬────────────────┐
//! │ stream │ task class          │ slab index     │
//! └────────┴─────────────────────┴────────────────┘
//! ```
//!
//! Stream endpoints are long-lived and receive many messages; reply
//! endpoints are one-shot. Well-known tokens have a fixed `first` word and
//! reserved low indexes so any process can address them without an
//! exchange.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Marks a long-lived stream endpoint.
pub const TOKEN_STREAM_FLAG: u64 = 1 << 63;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const TASK_CLASS_SHIFT: u32 = 32;
const TASK_CLASS_MASK: u64 = 0x7FFF_FFFF;

/// Fixed `first` word of every well-known token.
const WELL_KNOWN_FIRST: u64 = 0x1a61_1c0b_57a9_9d04;

/// Serialized size of a token on the wire.
pub const TOKEN_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub first: u64,
    pub second: u64,
}

impl Token {
    /// Sent back when a packet addressed an endpoint that does not exist.
    pub const ENDPOINT_NOT_FOUND: Token = Token::well_known(0);
    /// Liveness probe target.
    pub const PING: Token = Token::well_known(1);
    /// Delivered bytes that exist only to prove the connection is alive.
    pub const IGNORE_PACKET: Token = Token::well_known(2);

    /// Number of slab indexes reserved for well-known endpoints.
    pub const WELL_KNOWN_COUNT: u32 = 3;

    const fn well_known(index: u32) -> Token {
        Token {
            first: WELL_KNOWN_FIRST,
            second: TOKEN_STREAM_FLAG | index as u64,
        }
    }

    pub fn new(first: u64, index: u32, task_class: u32, stream: bool) -> Token {
        let mut second =
            ((task_class as u64 & TASK_CLASS_MASK) << TASK_CLASS_SHIFT) | index as u64;
        if stream {
            second |= TOKEN_STREAM_FLAG;
        }
        Token { first, second }
    }

    pub fn index(&self) -> u32 {
        (self.second & INDEX_MASK) as u32
    }

    pub fn task_class(&self) -> u32 {
        ((self.second >> TASK_CLASS_SHIFT) & TASK_CLASS_MASK) as u32
    }

    pub fn is_stream(&self) -> bool {
        self.second & TOKEN_STREAM_FLAG != 0
    }

    pub fn is_well_known(&self) -> bool {
        self.first == WELL_KNOWN_FIRST && self.index() < Self::WELL_KNOWN_COUNT
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.first);
        buf.put_u64_le(self.second);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TOKEN_BYTES);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Consumes 16 bytes from the front of `buf`.
    pub fn decode(buf: &mut Bytes) -> Option<Token> {
        if buf.len() < TOKEN_BYTES {
            return None;
        }
        Some(Token {
            first: buf.get_u64_le(),
            second: buf.get_u64_le(),
        })
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}:{:016x}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_packing() {
        let t = Token::new(0xDEAD, 42, 7, true);
        assert_eq!(t.index(), 42);
        assert_eq!(t.task_class(), 7);
        assert!(t.is_stream());

        let t = Token::new(0xDEAD, u32::MAX, 0, false);
        assert_eq!(t.index(), u32::MAX);
        assert!(!t.is_stream());
    }

    #[test]
    fn test_well_known_tokens_are_distinct() {
        let all = [
            Token::ENDPOINT_NOT_FOUND,
            Token::PING,
            Token::IGNORE_PACKET,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_well_known());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let t = Token::new(0x0123_4567_89ab_cdef, 9, 3, true);
        let mut bytes = t.encode();
        assert_eq!(bytes.len(), TOKEN_BYTES);
        assert_eq!(Token::decode(&mut bytes), Some(t));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_decode_short_buffer() {
        let mut buf = Bytes::from_static(&[0u8; 15]);
        assert_eq!(Token::decode(&mut buf), None);
    }
}
