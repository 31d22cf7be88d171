#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use taglog_net::codec::PacketCodec;
use taglog_net::handshake::ConnectPacket;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes through the wire-frame decoder: hostile lengths,
    // corrupt checksums and split frames must all fail cleanly.
    let mut checksummed = PacketCodec::new(true, 1 << 20, 1 << 16);
    let mut src = BytesMut::from(data);
    while let Ok(Some(_)) = checksummed.decode(&mut src) {}

    let mut plain = PacketCodec::new(false, 1 << 20, 1 << 16);
    let mut src = BytesMut::from(data);
    while let Ok(Some(_)) = plain.decode(&mut src) {}

    // And the handshake parser, including the legacy short form.
    let _ = ConnectPacket::decode(bytes::Bytes::copy_from_slice(data));
});
