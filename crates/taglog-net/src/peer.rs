//! Peer state machine.
//!
//! One `Peer` exists per destination address. It owns the send queues and
//! a *connection keeper* task that cycles through: wait for something to
//! send (or an adopted incoming connection), dial with jittered
//! exponential backoff, run the connection, and on failure discard
//! unreliable packets and go around again.
//!
//! While a connection is up, three loops race inside
//! [`run_connection`]:
//!
//! - **writer**: drains the unsent queue with a short jittered coalescing
//!   delay, writing at most `max_packet_send_bytes` per flush;
//! - **reader**: decodes frames and dispatches them to the endpoint map;
//! - **monitor**: sends a ping every interval and fails the connection if
//!   no bytes arrive across two consecutive intervals.
//!
//! Reliable packets live on a separate list for the life of the peer and
//! are re-queued at the front of every new connection; unreliable packets
//! are dropped on reset.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::codec::PacketCodec;
use crate::error::{Error, Result};
use crate::handshake::ConnectPacket;
use crate::token::Token;
use crate::transport::TransportInner;

struct Queues {
    unsent: VecDeque<Bytes>,
    reliable: Vec<Bytes>,
    recent_closes: VecDeque<Instant>,
}

pub(crate) struct Peer {
    pub(crate) dest: SocketAddr,
    queues: Mutex<Queues>,
    wake: Notify,
    bytes_received: AtomicU64,
    /// True while the keeper is dialing or running an outgoing connection;
    /// drives the simultaneous-open tiebreak.
    outgoing_active: AtomicBool,
    /// True when the current connection was adopted from the listener.
    running_incoming: AtomicBool,
    incoming_tx: mpsc::Sender<TcpStream>,
}

impl Peer {
    /// Create the peer and start its connection keeper.
    pub(crate) fn spawn(inner: Arc<TransportInner>, dest: SocketAddr) -> Arc<Peer> {
        let (incoming_tx, incoming_rx) = mpsc::channel(4);
        let peer = Arc::new(Peer {
            dest,
            queues: Mutex::new(Queues {
                unsent: VecDeque::new(),
                reliable: Vec::new(),
                recent_closes: VecDeque::new(),
            }),
            wake: Notify::new(),
            bytes_received: AtomicU64::new(0),
            outgoing_active: AtomicBool::new(false),
            running_incoming: AtomicBool::new(false),
            incoming_tx,
        });
        tokio::spawn(connection_keeper(inner, peer.clone(), incoming_rx));
        peer
    }

    /// Enqueue a framed payload (token + body). Reliable payloads are also
    /// remembered for re-send on every future connection.
    pub(crate) fn send(&self, payload: Bytes, reliable: bool) {
        {
            let mut queues = self.queues.lock().expect("peer queue lock");
            if reliable {
                queues.reliable.push(payload.clone());
            }
            queues.unsent.push_back(payload);
        }
        self.wake.notify_one();
    }

    /// Hand an accepted connection to the keeper. Returns false if the
    /// keeper is gone or saturated.
    pub(crate) fn adopt_incoming(&self, stream: TcpStream) -> bool {
        self.incoming_tx.try_send(stream).is_ok()
    }

    pub(crate) fn has_outgoing_active(&self) -> bool {
        self.outgoing_active.load(Ordering::Acquire)
    }

    pub(crate) fn is_running_incoming(&self) -> bool {
        self.running_incoming.load(Ordering::Acquire)
    }

    fn has_unsent(&self) -> bool {
        !self.queues.lock().expect("peer queue lock").unsent.is_empty()
    }

    /// Anything that justifies holding (or re-establishing) a connection:
    /// staged traffic, or reliable packets that must reach the peer.
    fn has_work(&self) -> bool {
        let queues = self.queues.lock().expect("peer queue lock");
        !queues.unsent.is_empty() || !queues.reliable.is_empty()
    }

    fn take_unsent(&self, max_bytes: usize) -> Vec<Bytes> {
        let mut queues = self.queues.lock().expect("peer queue lock");
        let mut out = Vec::new();
        let mut total = 0usize;
        while let Some(front) = queues.unsent.front() {
            if !out.is_empty() && total + front.len() > max_bytes {
                break;
            }
            total += front.len();
            out.push(queues.unsent.pop_front().expect("nonempty"));
        }
        out
    }

    /// Connection reset: unreliable traffic is gone; reliable packets are
    /// compacted into a fresh queue at the next connect.
    fn discard_unreliable(&self) {
        let mut queues = self.queues.lock().expect("peer queue lock");
        let dropped = queues.unsent.len();
        queues.unsent.clear();
        if dropped > 0 {
            debug!(dest = %self.dest, dropped, "discarded unreliable packets");
        }
    }

    fn requeue_reliable(&self) {
        let mut queues = self.queues.lock().expect("peer queue lock");
        let reliable: Vec<Bytes> = queues.reliable.clone();
        for payload in reliable.into_iter().rev() {
            queues.unsent.push_front(payload);
        }
    }

    /// Record a close; returns true if the peer has closed too often
    /// within the window.
    fn note_close(&self, window: Duration, limit: usize) -> bool {
        let mut queues = self.queues.lock().expect("peer queue lock");
        let now = Instant::now();
        queues.recent_closes.push_back(now);
        while let Some(front) = queues.recent_closes.front() {
            if now.duration_since(*front) > window {
                queues.recent_closes.pop_front();
            } else {
                break;
            }
        }
        queues.recent_closes.len() >= limit
    }
}

/// Outcome of one connection run.
enum ConnectionEnd {
    /// The listener handed us a replacement connection.
    Replaced(TcpStream),
    Failed(Error),
}

async fn connection_keeper(
    inner: Arc<TransportInner>,
    peer: Arc<Peer>,
    mut incoming_rx: mpsc::Receiver<TcpStream>,
) {
    let config = inner.config.clone();
    let mut shutdown = inner.shutdown_rx();
    let mut backoff = config.connect_backoff_initial;
    let mut adopted: Option<TcpStream> = None;

    loop {
        // Idle until there is something to send or a connection to adopt.
        while adopted.is_none() && !peer.has_work() {
            tokio::select! {
                _ = peer.wake.notified() => {}
                stream = incoming_rx.recv() => match stream {
                    Some(s) => adopted = Some(s),
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }

        let started = Instant::now();
        let end = match adopted.take() {
            Some(stream) => {
                peer.running_incoming.store(true, Ordering::Release);
                run_connection(&inner, &peer, stream, &mut incoming_rx, &mut shutdown).await
            }
            None => {
                peer.outgoing_active.store(true, Ordering::Release);
                let dialed = dial(&inner, peer.dest).await;
                match dialed {
                    Ok(stream) => {
                        peer.running_incoming.store(false, Ordering::Release);
                        run_connection(&inner, &peer, stream, &mut incoming_rx, &mut shutdown)
                            .await
                    }
                    Err(e) => ConnectionEnd::Failed(e),
                }
            }
        };
        peer.outgoing_active.store(false, Ordering::Release);
        peer.running_incoming.store(false, Ordering::Release);

        match end {
            ConnectionEnd::Replaced(stream) => {
                debug!(dest = %peer.dest, "replacing connection with adopted incoming");
                adopted = Some(stream);
                continue;
            }
            ConnectionEnd::Failed(Error::Shutdown) => return,
            ConnectionEnd::Failed(e) => {
                debug!(dest = %peer.dest, error = %e, "connection ended");
            }
        }

        peer.discard_unreliable();
        if peer.note_close(config.peer_close_window, config.peer_close_limit) {
            warn!(dest = %peer.dest, "peer closes too often; marking process degraded");
            inner.set_degraded();
        }

        // Backoff before redialing; a long-lived connection resets it.
        if started.elapsed() >= config.connect_backoff_reset {
            backoff = config.connect_backoff_initial;
        } else {
            backoff = (backoff * 2).min(config.connect_backoff_max);
        }
        let jittered = backoff.mul_f64(0.5 + rand::random::<f64>() * 0.5);
        tokio::select! {
            _ = tokio::time::sleep(jittered) => {}
            stream = incoming_rx.recv() => match stream {
                Some(s) => adopted = Some(s),
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn dial(inner: &Arc<TransportInner>, dest: SocketAddr) -> Result<TcpStream> {
    trace!(%dest, "dialing");
    let mut stream = TcpStream::connect(dest).await?;
    let packet =
        ConnectPacket::for_local(inner.local_addr, inner.connection_id, inner.connect_flags());
    packet.write_to(&mut stream).await?;
    Ok(stream)
}

async fn run_connection(
    inner: &Arc<TransportInner>,
    peer: &Arc<Peer>,
    stream: TcpStream,
    incoming_rx: &mut mpsc::Receiver<TcpStream>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let config = &inner.config;
    info!(dest = %peer.dest, incoming = peer.is_running_incoming(), "connection established");
    let (read_half, write_half) = stream.into_split();
    let checksummed = !config.tls_mode;
    let mut reader = tokio_util::codec::FramedRead::new(
        read_half,
        PacketCodec::new(checksummed, config.packet_limit, config.packet_warn_bytes),
    );
    let mut writer = tokio_util::codec::FramedWrite::new(
        write_half,
        PacketCodec::new(checksummed, config.packet_limit, config.packet_warn_bytes),
    );

    // Reliable traffic is re-sent on every new connection.
    peer.requeue_reliable();
    peer.wake.notify_one();

    let read_loop = async {
        loop {
            match reader.next().await {
                Some(Ok(payload)) => {
                    peer.bytes_received
                        .fetch_add(payload.len() as u64 + 8, Ordering::Relaxed);
                    inner.dispatch(peer.dest, payload);
                }
                Some(Err(e)) => return e,
                None => return Error::ConnectionFailed,
            }
        }
    };

    let write_loop = async {
        loop {
            while !peer.has_unsent() {
                peer.wake.notified().await;
            }
            let delay = config.max_coalesce_delay.mul_f64(rand::random::<f64>());
            tokio::time::sleep(delay).await;
            loop {
                let batch = peer.take_unsent(config.max_packet_send_bytes);
                if batch.is_empty() {
                    break;
                }
                for payload in batch {
                    if let Err(e) = writer.feed(payload).await {
                        return e;
                    }
                }
                if let Err(e) = writer.flush().await {
                    return e;
                }
            }
        }
    };

    let monitor_loop = async {
        let mut last_seen = peer.bytes_received.load(Ordering::Relaxed);
        let mut silent_intervals = 0u32;
        loop {
            tokio::time::sleep(config.ping_interval).await;
            let seen = peer.bytes_received.load(Ordering::Relaxed);
            if seen == last_seen {
                silent_intervals += 1;
                if silent_intervals >= 2 {
                    return Error::ConnectionFailed;
                }
            } else {
                silent_intervals = 0;
            }
            last_seen = seen;
            // Ping elicits an ignore-packet reply, which moves the byte
            // counter on a healthy connection.
            let mut ping = BytesMut::new();
            Token::PING.encode_to(&mut ping);
            peer.send(ping.freeze(), false);
        }
    };

    tokio::select! {
        e = read_loop => ConnectionEnd::Failed(e),
        e = write_loop => ConnectionEnd::Failed(e),
        e = monitor_loop => ConnectionEnd::Failed(e),
        stream = incoming_rx.recv() => match stream {
            Some(s) => ConnectionEnd::Replaced(s),
            None => ConnectionEnd::Failed(Error::ConnectionFailed),
        },
        _ = shutdown.changed() => ConnectionEnd::Failed(Error::Shutdown),
    }
}
