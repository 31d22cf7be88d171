//! Transport integration tests: delivery, loopback, request/reply,
//! simultaneous open and the incompatible-handshake policy.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use taglog_net::{Token, Transport, TransportConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn bind_transport() -> Transport {
    Transport::bind(TransportConfig::default(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

async fn recv_with_timeout(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<taglog_net::InboundPacket>,
) -> taglog_net::InboundPacket {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("endpoint closed")
}

#[tokio::test]
async fn test_send_between_processes() {
    let a = bind_transport().await;
    let b = bind_transport().await;
    let (token, mut rx) = b.register_stream(0);

    a.send_unreliable(b.local_addr(), token, Bytes::from_static(b"over the wire"));
    let packet = recv_with_timeout(&mut rx).await;
    assert_eq!(packet.payload, Bytes::from_static(b"over the wire"));
    assert_eq!(packet.from, a.local_addr());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_loopback_fast_path() {
    let a = bind_transport().await;
    let (token, mut rx) = a.register_stream(0);
    a.send_unreliable(a.local_addr(), token, Bytes::from_static(b"to myself"));
    let packet = recv_with_timeout(&mut rx).await;
    assert_eq!(packet.payload, Bytes::from_static(b"to myself"));
    assert_eq!(packet.from, a.local_addr());
    a.shutdown();
}

#[tokio::test]
async fn test_replies_ride_the_same_connection() {
    let a = bind_transport().await;
    let b = bind_transport().await;
    let (token, mut rx) = b.register_stream(0);

    // Request from a, reply from b back to the sender's canonical address.
    a.send_unreliable(b.local_addr(), token, Bytes::from_static(b"ping?"));
    let request = recv_with_timeout(&mut rx).await;

    let (reply_token, mut reply_rx) = a.register_stream(0);
    // Tell a where to expect the reply, then answer it.
    b.send_unreliable(request.from, reply_token, Bytes::from_static(b"pong!"));
    let reply = recv_with_timeout(&mut reply_rx).await;
    assert_eq!(reply.payload, Bytes::from_static(b"pong!"));

    a.shutdown();
    b.shutdown();
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    reply: Token,
    text: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct EchoReply {
    text: String,
}

#[tokio::test]
async fn test_request_reply_helper() {
    let client = bind_transport().await;
    let server = bind_transport().await;
    let (token, mut rx) = server.register_stream(0);

    let server2 = server.clone();
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let req: EchoRequest = Transport::decode_message(&packet.payload).unwrap();
            let reply = EchoReply {
                text: req.text.to_uppercase(),
            };
            server2.send_unreliable(
                packet.from,
                req.reply,
                Transport::encode_message(&reply).unwrap(),
            );
        }
    });

    let reply: EchoReply = client
        .request(
            server.local_addr(),
            token,
            |reply| EchoRequest {
                reply,
                text: "quiet".to_string(),
            },
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(reply.text, "QUIET");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_token_does_not_wedge_the_connection() {
    let a = bind_transport().await;
    let b = bind_transport().await;

    let bogus = Token::new(123, 999, 0, true);
    a.send_unreliable(b.local_addr(), bogus, Bytes::from_static(b"nobody home"));

    // The connection must still deliver to a real endpoint afterwards.
    let (token, mut rx) = b.register_stream(0);
    a.send_unreliable(b.local_addr(), token, Bytes::from_static(b"real"));
    let packet = recv_with_timeout(&mut rx).await;
    assert_eq!(packet.payload, Bytes::from_static(b"real"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_simultaneous_open_leaves_one_connection() {
    // Both sides send before either connection lands. Whether or not the
    // dials actually cross, the topology must converge to a single
    // connection: exactly one side runs an adopted (incoming) connection
    // and the other keeps its outgoing one — the larger canonical address
    // wins a genuine tie.
    let a = bind_transport().await;
    let b = bind_transport().await;
    let (token_a, mut rx_a) = a.register_stream(0);
    let (token_b, mut rx_b) = b.register_stream(0);

    // Reliable sends: a connection that loses the tiebreak mid-flight may
    // drop unreliable traffic, but reliable packets are re-sent on the
    // surviving connection.
    a.send_reliable(b.local_addr(), token_b, Bytes::from_static(b"from a"));
    b.send_reliable(a.local_addr(), token_a, Bytes::from_static(b"from b"));

    let got_b = recv_with_timeout(&mut rx_b).await;
    let got_a = recv_with_timeout(&mut rx_a).await;
    assert_eq!(got_b.payload, Bytes::from_static(b"from a"));
    assert_eq!(got_a.payload, Bytes::from_static(b"from b"));

    // Let any losing connection finish dying, then check the topology.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let a_incoming = a.peer_connection_is_incoming(b.local_addr()).unwrap();
    let b_incoming = b.peer_connection_is_incoming(a.local_addr()).unwrap();
    assert_ne!(
        a_incoming, b_incoming,
        "exactly one side should hold the adopted connection"
    );

    // And traffic still flows both ways over the survivor. Reliable
    // re-sends may have produced duplicates of the first messages; skip
    // those.
    a.send_unreliable(b.local_addr(), token_b, Bytes::from_static(b"again a"));
    b.send_unreliable(a.local_addr(), token_a, Bytes::from_static(b"again b"));
    loop {
        let got = recv_with_timeout(&mut rx_b).await.payload;
        if got == Bytes::from_static(b"again a") {
            break;
        }
        assert_eq!(got, Bytes::from_static(b"from a"));
    }
    loop {
        let got = recv_with_timeout(&mut rx_a).await.payload;
        if got == Bytes::from_static(b"again b") {
            break;
        }
        assert_eq!(got, Bytes::from_static(b"from b"));
    }

    a.shutdown();
    b.shutdown();
}

/// Handcrafted connect packet with an arbitrary protocol version.
fn doctored_connect_packet(protocol_version: u64, flags: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&protocol_version.to_le_bytes());
    payload.extend_from_slice(&9999u16.to_le_bytes()); // canonical port
    payload.extend_from_slice(&42u64.to_le_bytes()); // connection id
    payload.extend_from_slice(&u32::from(std::net::Ipv4Addr::new(127, 0, 0, 1)).to_le_bytes());
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(&[0u8; 16]); // ip6
    let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
    wire.extend_from_slice(&payload);
    wire
}

#[tokio::test]
async fn test_incompatible_peer_is_closed() {
    let server = bind_transport().await;
    let mut stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    stream
        .write_all(&doctored_connect_packet(0xdead_0000_0000_0000, 0))
        .await
        .unwrap();

    // A plain incompatible peer gets its connection closed.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf)).await;
    assert_eq!(read.expect("server should close").unwrap(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_incompatible_multi_version_peer_stays_open() {
    let server = bind_transport().await;
    let mut stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    stream
        .write_all(&doctored_connect_packet(0xdead_0000_0000_0000, 0x1))
        .await
        .unwrap();

    // The connection is kept alive but nothing is ever delivered. A short
    // read timeout demonstrates "still open": no EOF arrives.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await;
    assert!(read.is_err(), "connection should stay open with no traffic");
    server.shutdown();
}
