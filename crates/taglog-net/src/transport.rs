//! Transport: listener, peer table, dispatch and the send API.
//!
//! A `Transport` owns the process-wide endpoint map, one `Peer` per
//! destination it has ever sent to, and the accept loop. Sends addressed
//! to the local listen address never touch the network: the payload is
//! dispatched in-process (the loopback fast path).
//!
//! ## Incoming connections
//!
//! The accept loop reads the dialer's [`ConnectPacket`], derives the
//! canonical peer address, and then:
//!
//! - **incompatible protocol**: the peer is recorded; a multi-version
//!   client's connection is kept open but delivers nothing, anyone else is
//!   closed.
//! - **simultaneous open**: if this process has an outgoing connection to
//!   that peer and the larger canonical address is ours, the incoming
//!   connection is closed; otherwise the peer adopts it and abandons its
//!   outgoing attempt.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::endpoint::{EndpointMap, InboundPacket};
use crate::error::{Error, Result};
use crate::handshake::{canonical_greater, ConnectPacket, FLAG_MULTI_VERSION_CLIENT};
use crate::peer::Peer;
use crate::token::Token;

/// A peer that spoke an incompatible protocol version.
#[derive(Debug, Clone)]
struct IncompatiblePeer {
    connection_id: u64,
    first_seen: Instant,
    multi_version: bool,
}

pub(crate) struct TransportInner {
    pub(crate) config: TransportConfig,
    pub(crate) local_addr: SocketAddr,
    pub(crate) connection_id: u64,
    endpoints: Mutex<EndpointMap>,
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    incompatible: Mutex<HashMap<SocketAddr, IncompatiblePeer>>,
    degraded: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Back-reference to our own Arc; peers hold clones of it.
    self_ref: Weak<TransportInner>,
}

impl TransportInner {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn connect_flags(&self) -> u16 {
        if self.config.multi_version_client {
            FLAG_MULTI_VERSION_CLIENT
        } else {
            0
        }
    }

    pub(crate) fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    fn peer(&self, dest: SocketAddr) -> Option<Arc<Peer>> {
        let this = self.self_ref.upgrade()?;
        let mut peers = self.peers.lock().expect("peer table lock");
        Some(
            peers
                .entry(dest)
                .or_insert_with(|| Peer::spawn(this, dest))
                .clone(),
        )
    }

    /// Deliver one payload (token + body) that arrived from `from`, or was
    /// sent to ourselves over the loopback fast path.
    pub(crate) fn dispatch(&self, from: SocketAddr, mut payload: Bytes) {
        let Some(token) = Token::decode(&mut payload) else {
            warn!(%from, "packet too short for a token");
            return;
        };
        if token == Token::PING {
            // Answer with bytes the sender's monitor will count.
            self.send_packet(from, Token::IGNORE_PACKET, Bytes::new(), false);
            return;
        }
        if token == Token::IGNORE_PACKET {
            return;
        }
        if token == Token::ENDPOINT_NOT_FOUND {
            let mut body = payload;
            let missing = Token::decode(&mut body);
            debug!(%from, ?missing, "peer reports endpoint not found");
            return;
        }
        let delivered = self
            .endpoints
            .lock()
            .expect("endpoint map lock")
            .deliver(token, InboundPacket { from, payload });
        if !delivered {
            debug!(%from, %token, "no endpoint for token");
            self.send_packet(from, Token::ENDPOINT_NOT_FOUND, token.encode(), false);
        }
    }

    /// Queue a packet for `dest`, taking the loopback fast path when the
    /// destination is this process.
    pub(crate) fn send_packet(&self, dest: SocketAddr, token: Token, body: Bytes, reliable: bool) {
        let mut payload = BytesMut::with_capacity(16 + body.len());
        token.encode_to(&mut payload);
        payload.extend_from_slice(&body);
        let payload = payload.freeze();
        if dest == self.local_addr {
            self.dispatch(self.local_addr, payload);
            return;
        }
        if let Some(peer) = self.peer(dest) {
            peer.send(payload, reliable);
        }
    }

    fn record_incompatible(&self, addr: SocketAddr, packet: &ConnectPacket) {
        let ttl = self.config.incompatible_peer_ttl;
        let mut map = self.incompatible.lock().expect("incompatible map lock");
        // Known multi-version peers are expected; their records age out.
        map.retain(|_, p| !(p.multi_version && p.first_seen.elapsed() >= ttl));
        let entry = map.entry(addr).or_insert(IncompatiblePeer {
            connection_id: packet.connection_id,
            first_seen: Instant::now(),
            multi_version: packet.is_multi_version_client(),
        });
        debug!(
            peer = %addr,
            connection_id = entry.connection_id,
            "recorded incompatible peer"
        );
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, observed: SocketAddr) {
        let mut stream = stream;
        let packet = match ConnectPacket::read_from(&mut stream).await {
            Ok(p) => p,
            Err(e) => {
                debug!(%observed, error = %e, "bad connect packet");
                return;
            }
        };
        let canonical = packet.canonical_addr(observed.ip());

        if !packet.is_compatible() {
            warn!(
                peer = %canonical,
                version = format_args!("{:#x}", packet.protocol_version),
                multi_version = packet.is_multi_version_client(),
                "incompatible peer connected"
            );
            self.record_incompatible(canonical, &packet);
            if packet.is_multi_version_client() {
                // Keep the connection alive but deliver nothing.
                tokio::spawn(async move {
                    let mut sink = [0u8; 4096];
                    use tokio::io::AsyncReadExt;
                    loop {
                        match stream.read(&mut sink).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
            return;
        }

        let Some(peer) = self.peer(canonical) else {
            return;
        };
        if peer.has_outgoing_active() && canonical_greater(self.local_addr, canonical) {
            // Simultaneous open and we are the larger address: our
            // outgoing connection wins, the incoming one dies here.
            debug!(peer = %canonical, "closing incoming connection (tiebreak)");
            return;
        }
        if !peer.adopt_incoming(stream) {
            debug!(peer = %canonical, "peer refused incoming connection");
        }
    }
}

/// Process-wide message bus handle. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Bind the listener and start accepting connections.
    pub async fn bind(config: TransportConfig, listen_addr: SocketAddr) -> Result<Transport> {
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::AddressInUse
            } else {
                Error::Io(e)
            }
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| TransportInner {
            config,
            local_addr,
            connection_id: rand::thread_rng().next_u64(),
            endpoints: Mutex::new(EndpointMap::new()),
            peers: Mutex::new(HashMap::new()),
            incompatible: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            shutdown,
            self_ref: self_ref.clone(),
        });
        info!(%local_addr, "transport listening");

        let accept_inner = inner.clone();
        tokio::spawn(async move {
            let mut shutdown = accept_inner.shutdown_rx();
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, observed)) => {
                            tokio::spawn(accept_inner.clone().handle_incoming(stream, observed));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(Transport { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Register a long-lived stream endpoint.
    pub fn register_stream(
        &self,
        task_class: u32,
    ) -> (Token, mpsc::UnboundedReceiver<InboundPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint map lock")
            .insert_stream(task_class, tx);
        (token, rx)
    }

    /// Register a one-shot reply endpoint.
    pub fn register_reply(&self) -> (Token, oneshot::Receiver<InboundPacket>) {
        let (tx, rx) = oneshot::channel();
        let token = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint map lock")
            .insert_reply(tx);
        (token, rx)
    }

    pub fn deregister(&self, token: Token) {
        self.inner
            .endpoints
            .lock()
            .expect("endpoint map lock")
            .remove(token);
    }

    /// Fire-and-forget send; dropped on connection reset.
    pub fn send_unreliable(&self, dest: SocketAddr, token: Token, body: Bytes) {
        self.inner.send_packet(dest, token, body, false);
    }

    /// Re-sent on every new connection to `dest` until the peer dies.
    pub fn send_reliable(&self, dest: SocketAddr, token: Token, body: Bytes) {
        self.inner.send_packet(dest, token, body, true);
    }

    /// Whether the current connection to `dest` was adopted from the
    /// listener (as opposed to dialed). `None` if no such peer exists.
    pub fn peer_connection_is_incoming(&self, dest: SocketAddr) -> Option<bool> {
        let peers = self.inner.peers.lock().expect("peer table lock");
        peers.get(&dest).map(|p| p.is_running_incoming())
    }

    /// Serialize a message body with the wire codec.
    pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(message)?))
    }

    pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(payload)?)
    }

    /// One round trip: register a reply endpoint, send the request built
    /// around its token, await the reply.
    pub async fn request<Req, Resp>(
        &self,
        dest: SocketAddr,
        token: Token,
        make_request: impl FnOnce(Token) -> Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (reply_token, reply_rx) = self.register_reply();
        let request = make_request(reply_token);
        let body = Self::encode_message(&request)?;
        self.send_unreliable(dest, token, body);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(packet)) => Self::decode_message(&packet.payload),
            Ok(Err(_)) => Err(Error::ReplyDropped),
            Err(_) => {
                self.deregister(reply_token);
                Err(Error::ConnectionFailed)
            }
        }
    }

    /// Stop the accept loop and every peer task.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}
