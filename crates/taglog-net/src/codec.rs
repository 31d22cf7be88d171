//! Packet frame codec.
//!
//! Post-handshake frame format:
//!
//! ```text
//! ┌──────────────┬────────────────┬─────────────────────────┐
//! │ Length       │ CRC32C         │ Payload                 │
//! │ (4 bytes LE) │ (4 bytes LE)   │ (token + message)       │
//! └──────────────┴────────────────┴─────────────────────────┘
//! ```
//!
//! In TLS mode the stream already provides integrity, so the CRC word is
//! omitted. The checksum is CRC32C (Castagnoli) over the payload only.
//! A frame longer than the packet limit fails the connection; one longer
//! than the warn threshold is logged and delivered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{Error, Result};

pub struct PacketCodec {
    /// CRC32C present in each frame (false in TLS mode).
    checksummed: bool,
    packet_limit: usize,
    packet_warn_bytes: usize,
}

impl PacketCodec {
    pub fn new(checksummed: bool, packet_limit: usize, packet_warn_bytes: usize) -> Self {
        Self {
            checksummed,
            packet_limit,
            packet_warn_bytes,
        }
    }

    fn header_len(&self) -> usize {
        if self.checksummed {
            8
        } else {
            4
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let header = self.header_len();
        if src.len() < header {
            return Ok(None);
        }
        let length = (&src[..4]).get_u32_le() as usize;
        if length > self.packet_limit {
            return Err(Error::PacketTooLarge {
                size: length,
                limit: self.packet_limit,
            });
        }
        if src.len() < header + length {
            src.reserve(header + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let expected_crc = if self.checksummed {
            Some(src.get_u32_le())
        } else {
            None
        };
        let payload = src.split_to(length).freeze();
        if let Some(expected) = expected_crc {
            let actual = crc32c::crc32c(&payload);
            if actual != expected {
                return Err(Error::ChecksumFailed);
            }
        }
        if length > self.packet_warn_bytes {
            warn!(length, "received oversized packet");
        }
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.packet_limit {
            return Err(Error::PacketTooLarge {
                size: payload.len(),
                limit: self.packet_limit,
            });
        }
        if payload.len() > self.packet_warn_bytes {
            warn!(length = payload.len(), "sending oversized packet");
        }
        dst.reserve(self.header_len() + payload.len());
        dst.put_u32_le(payload.len() as u32);
        if self.checksummed {
            dst.put_u32_le(crc32c::crc32c(&payload));
        }
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::new(true, 1024, 512)
    }

    #[test]
    fn test_roundtrip() {
        let mut c = codec();
        let mut wire = BytesMut::new();
        c.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
        c.encode(Bytes::from_static(b"world"), &mut wire).unwrap();
        assert_eq!(c.decode(&mut wire).unwrap().unwrap(), "hello");
        assert_eq!(c.decode(&mut wire).unwrap().unwrap(), "world");
        assert!(c.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut c = codec();
        let mut wire = BytesMut::new();
        c.encode(Bytes::from_static(b"payload"), &mut wire).unwrap();
        let mut partial = wire.split_to(wire.len() - 3);
        assert!(c.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        assert_eq!(c.decode(&mut partial).unwrap().unwrap(), "payload");
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut c = codec();
        let mut wire = BytesMut::new();
        c.encode(Bytes::from_static(b"payload"), &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x40; // bit flip
        assert!(matches!(c.decode(&mut wire), Err(Error::ChecksumFailed)));
    }

    #[test]
    fn test_unchecksummed_mode_has_no_crc_word() {
        let mut c = PacketCodec::new(false, 1024, 512);
        let mut wire = BytesMut::new();
        c.encode(Bytes::from_static(b"abc"), &mut wire).unwrap();
        assert_eq!(wire.len(), 4 + 3);
        assert_eq!(c.decode(&mut wire).unwrap().unwrap(), "abc");
    }

    #[test]
    fn test_oversized_packet_is_refused() {
        let mut c = codec();
        let mut wire = BytesMut::new();
        let big = Bytes::from(vec![0u8; 2048]);
        assert!(matches!(
            c.encode(big, &mut wire),
            Err(Error::PacketTooLarge { .. })
        ));

        // And on the receive side: a hostile length header.
        let mut hostile = BytesMut::new();
        hostile.put_u32_le(1_000_000);
        hostile.put_u32_le(0);
        assert!(matches!(
            c.decode(&mut hostile),
            Err(Error::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_payload() {
        let mut c = codec();
        let mut wire = BytesMut::new();
        c.encode(Bytes::new(), &mut wire).unwrap();
        assert_eq!(c.decode(&mut wire).unwrap().unwrap(), Bytes::new());
    }
}
