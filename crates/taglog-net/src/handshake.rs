//! Connection handshake.
//!
//! The first bytes on any connection are a `ConnectPacket`, sent by the
//! dialing side:
//!
//! ```text
//! u32  length            (excludes this field)
//! u64  protocol_version
//! u16  canonical_remote_port
//! u64  connection_id
//! u32  remote_ip4
//! u16  flags             ─┐ only in the current form;
//! [u8; 16] remote_ip6    ─┘ absent in the legacy short form
//! ```
//!
//! The legacy short form (22 payload bytes, no flags and no IPv6 address)
//! is still accepted; its flags read as zero. Anything shorter is
//! malformed.
//!
//! The canonical address a peer advertises is the address *other*
//! processes should dial it at: the IP it believes it has plus its listen
//! port. The acceptor uses it to attach an incoming connection to the
//! right peer and to break simultaneous-open ties.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use taglog_core::{protocol_compatible, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Set when the dialer is a multi-version client: on protocol mismatch the
/// acceptor keeps the connection open (delivering nothing) instead of
/// closing it.
pub const FLAG_MULTI_VERSION_CLIENT: u16 = 0x1;

const SHORT_PAYLOAD: usize = 8 + 2 + 8 + 4;
const FULL_PAYLOAD: usize = SHORT_PAYLOAD + 2 + 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: u64,
    pub canonical_remote_port: u16,
    pub connection_id: u64,
    pub remote_ip4: u32,
    pub flags: u16,
    pub remote_ip6: [u8; 16],
}

impl ConnectPacket {
    /// Build the packet this process sends when dialing, advertising its
    /// canonical (listen) address.
    pub fn for_local(local: SocketAddr, connection_id: u64, flags: u16) -> Self {
        let (ip4, ip6) = match local.ip() {
            IpAddr::V4(v4) => (u32::from(v4), [0u8; 16]),
            IpAddr::V6(v6) => (0, v6.octets()),
        };
        Self {
            protocol_version: PROTOCOL_VERSION,
            canonical_remote_port: local.port(),
            connection_id,
            remote_ip4: ip4,
            flags,
            remote_ip6: ip6,
        }
    }

    pub fn is_multi_version_client(&self) -> bool {
        self.flags & FLAG_MULTI_VERSION_CLIENT != 0
    }

    pub fn is_compatible(&self) -> bool {
        protocol_compatible(self.protocol_version, PROTOCOL_VERSION)
    }

    /// The address this peer says it can be dialed at. The IP observed on
    /// the socket wins over the advertised one when they disagree (NAT),
    /// matching what the dialer of the reverse direction would use.
    pub fn canonical_addr(&self, observed_ip: IpAddr) -> SocketAddr {
        let advertised: Option<IpAddr> = if self.remote_ip4 != 0 {
            Some(IpAddr::V4(Ipv4Addr::from(self.remote_ip4)))
        } else if self.remote_ip6 != [0u8; 16] {
            Some(IpAddr::V6(Ipv6Addr::from(self.remote_ip6)))
        } else {
            None
        };
        SocketAddr::new(advertised.unwrap_or(observed_ip), self.canonical_remote_port)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + FULL_PAYLOAD);
        buf.put_u32_le(FULL_PAYLOAD as u32);
        buf.put_u64_le(self.protocol_version);
        buf.put_u16_le(self.canonical_remote_port);
        buf.put_u64_le(self.connection_id);
        buf.put_u32_le(self.remote_ip4);
        buf.put_u16_le(self.flags);
        buf.put_slice(&self.remote_ip6);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < SHORT_PAYLOAD {
            return Err(Error::CorruptPacket(format!(
                "connect packet payload of {} bytes",
                payload.len()
            )));
        }
        let protocol_version = payload.get_u64_le();
        let canonical_remote_port = payload.get_u16_le();
        let connection_id = payload.get_u64_le();
        let remote_ip4 = payload.get_u32_le();
        let (flags, remote_ip6) = if payload.len() >= 2 + 16 {
            let flags = payload.get_u16_le();
            let mut ip6 = [0u8; 16];
            payload.copy_to_slice(&mut ip6);
            (flags, ip6)
        } else {
            (0, [0u8; 16])
        };
        Ok(Self {
            protocol_version,
            canonical_remote_port,
            connection_id,
            remote_ip4,
            flags,
            remote_ip6,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len < SHORT_PAYLOAD || len > 1024 {
            return Err(Error::CorruptPacket(format!(
                "connect packet length {}",
                len
            )));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Self::decode(Bytes::from(payload))
    }
}

/// Simultaneous-open tiebreak: true if `a` is canonically greater than
/// `b`, comparing the IP bytes first and the port second.
pub fn canonical_greater(a: SocketAddr, b: SocketAddr) -> bool {
    let key = |addr: SocketAddr| -> (Vec<u8>, u16) {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        (ip, addr.port())
    };
    key(a) > key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_full_form() {
        let pkt = ConnectPacket::for_local("10.1.2.3:4500".parse().unwrap(), 77, 0);
        let mut wire = pkt.encode();
        let len = (&wire[..4]).get_u32_le() as usize;
        assert_eq!(len, wire.len() - 4);
        let decoded = ConnectPacket::decode(wire.split_off(4)).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(
            decoded.canonical_addr("9.9.9.9".parse().unwrap()),
            "10.1.2.3:4500".parse().unwrap()
        );
    }

    #[test]
    fn test_short_form_reads_with_zero_flags() {
        let pkt = ConnectPacket::for_local(
            "10.1.2.3:4500".parse().unwrap(),
            1,
            FLAG_MULTI_VERSION_CLIENT,
        );
        let wire = pkt.encode();
        // Strip the length word, then truncate to the legacy short form.
        let short = wire.slice(4..4 + SHORT_PAYLOAD);
        let decoded = ConnectPacket::decode(short).unwrap();
        assert_eq!(decoded.protocol_version, pkt.protocol_version);
        assert_eq!(decoded.canonical_remote_port, 4500);
        assert_eq!(decoded.flags, 0);
        assert_eq!(decoded.remote_ip6, [0u8; 16]);
    }

    #[test]
    fn test_ipv6_address_roundtrip() {
        let pkt = ConnectPacket::for_local("[2001:db8::7]:9000".parse().unwrap(), 2, 0);
        assert_eq!(pkt.remote_ip4, 0);
        let decoded = ConnectPacket::decode(pkt.encode().slice(4..)).unwrap();
        assert_eq!(
            decoded.canonical_addr("1.2.3.4".parse().unwrap()),
            "[2001:db8::7]:9000".parse().unwrap()
        );
    }

    #[test]
    fn test_unadvertised_ip_falls_back_to_observed() {
        let mut pkt = ConnectPacket::for_local("0.0.0.0:8000".parse().unwrap(), 3, 0);
        pkt.remote_ip4 = 0;
        let decoded = ConnectPacket::decode(pkt.encode().slice(4..)).unwrap();
        assert_eq!(
            decoded.canonical_addr("172.16.0.9".parse().unwrap()),
            "172.16.0.9:8000".parse().unwrap()
        );
    }

    #[test]
    fn test_truncated_packet_is_corrupt() {
        let pkt = ConnectPacket::for_local("10.0.0.1:1".parse().unwrap(), 4, 0);
        let short = pkt.encode().slice(4..10);
        assert!(matches!(
            ConnectPacket::decode(short),
            Err(Error::CorruptPacket(_))
        ));
    }

    #[test]
    fn test_compatibility_check() {
        let mut pkt = ConnectPacket::for_local("10.0.0.1:1".parse().unwrap(), 5, 0);
        assert!(pkt.is_compatible());
        pkt.protocol_version ^= 0x1_0000; // outside the patch bits
        assert!(!pkt.is_compatible());
        pkt.protocol_version = PROTOCOL_VERSION | 0xFF; // patch bits only
        assert!(pkt.is_compatible());
    }

    #[test]
    fn test_canonical_greater() {
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        assert!(canonical_greater(b, a));
        assert!(!canonical_greater(a, b));
        let c: SocketAddr = "10.0.0.1:2".parse().unwrap();
        assert!(canonical_greater(c, a));
    }
}
