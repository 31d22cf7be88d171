//! TagLog Wire Transport
//!
//! Connection-oriented message bus between taglog processes. Every
//! receivable thing in a process is an **endpoint** identified by a 128-bit
//! token; a packet is a token plus a serialized message, framed with a
//! length prefix and a CRC32C checksum.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ send(dest, token, msg) ┌──────────┐
//! │  caller   │ ──────────────────────►│ Transport│
//! └───────────┘                        └────┬─────┘
//!                 loopback fast path        │ per-destination
//!        ┌───────────────────────────┐      ▼
//!        │                      ┌─────────────┐
//!        ▼                      │    Peer     │ unsent + reliable queues
//! ┌────────────┐               │  keeper task │ backoff · writer · reader
//! │ EndpointMap│◄──────────────┤   monitor    │ ping liveness
//! └────────────┘   dispatch    └─────────────┘
//! ```
//!
//! - **Reliable** sends survive reconnects: they are re-sent on every new
//!   connection until the peer is torn down. **Unreliable** sends are
//!   dropped on connection reset.
//! - A connection starts with a [`handshake::ConnectPacket`]; incompatible
//!   protocol versions either close the connection or, for multi-version
//!   clients, leave it open but deliver nothing.
//! - When both sides dial each other at once, the peer with the larger
//!   canonical address keeps its outgoing connection.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod peer;
pub mod token;
pub mod transport;

pub use config::TransportConfig;
pub use endpoint::InboundPacket;
pub use error::{Error, Result};
pub use token::Token;
pub use transport::Transport;
