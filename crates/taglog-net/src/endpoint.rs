//! Endpoint map.
//!
//! The per-process slab that turns an incoming token into a receiver. A
//! token's low 32 bits index the slab; its random `first` word must match
//! the word recorded at registration, so a stale token (slot reused after
//! deregistration) misses instead of delivering to the wrong receiver.
//!
//! Receivers come in two shapes, mirroring the two token kinds: stream
//! endpoints feed an unbounded channel for as long as they stay
//! registered; reply endpoints deliver exactly one message and vacate
//! their slot.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use crate::token::Token;

/// A packet delivered to a local endpoint.
#[derive(Debug)]
pub struct InboundPacket {
    /// Canonical address of the sending peer; replies go here.
    pub from: SocketAddr,
    /// Message body (the token has already been stripped).
    pub payload: Bytes,
}

enum Receiver {
    Stream(mpsc::UnboundedSender<InboundPacket>),
    Reply(Option<oneshot::Sender<InboundPacket>>),
}

struct Slot {
    first: u64,
    receiver: Receiver,
}

/// Slab of local receive endpoints.
#[derive(Default)]
pub struct EndpointMap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl EndpointMap {
    pub fn new() -> Self {
        // Low indexes are reserved for well-known endpoints, which are
        // handled before the slab is consulted.
        Self {
            slots: (0..Token::WELL_KNOWN_COUNT).map(|_| None).collect(),
            free: Vec::new(),
        }
    }

    fn claim_slot(&mut self) -> u32 {
        if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(None);
            (self.slots.len() - 1) as u32
        }
    }

    /// Register a long-lived stream endpoint.
    pub fn insert_stream(
        &mut self,
        task_class: u32,
        sender: mpsc::UnboundedSender<InboundPacket>,
    ) -> Token {
        let index = self.claim_slot();
        let first = rand::thread_rng().next_u64();
        self.slots[index as usize] = Some(Slot {
            first,
            receiver: Receiver::Stream(sender),
        });
        Token::new(first, index, task_class, true)
    }

    /// Register a one-shot reply endpoint.
    pub fn insert_reply(&mut self, sender: oneshot::Sender<InboundPacket>) -> Token {
        let index = self.claim_slot();
        let first = rand::thread_rng().next_u64();
        self.slots[index as usize] = Some(Slot {
            first,
            receiver: Receiver::Reply(Some(sender)),
        });
        Token::new(first, index, 0, false)
    }

    /// Deliver a packet. Returns false if no live endpoint matched (the
    /// caller then answers with `ENDPOINT_NOT_FOUND`).
    pub fn deliver(&mut self, token: Token, packet: InboundPacket) -> bool {
        let index = token.index() as usize;
        let Some(slot) = self.slots.get_mut(index).and_then(|s| s.as_mut()) else {
            return false;
        };
        if slot.first != token.first {
            return false;
        }
        let (delivered, retire) = match &mut slot.receiver {
            Receiver::Stream(sender) => {
                let ok = sender.send(packet).is_ok();
                // A dropped receiver retires the slot.
                (ok, !ok)
            }
            Receiver::Reply(sender) => {
                let ok = match sender.take() {
                    Some(tx) => tx.send(packet).is_ok(),
                    None => false,
                };
                (ok, true)
            }
        };
        if retire {
            self.slots[index] = None;
            self.free.push(index as u32);
        }
        delivered
    }

    /// Drop an endpoint; its token stops matching immediately.
    pub fn remove(&mut self, token: Token) {
        let index = token.index() as usize;
        if let Some(Some(slot)) = self.slots.get(index) {
            if slot.first == token.first {
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> InboundPacket {
        InboundPacket {
            from: "127.0.0.1:1".parse().unwrap(),
            payload: Bytes::from_static(b"hi"),
        }
    }

    #[test]
    fn test_stream_delivery() {
        let mut map = EndpointMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = map.insert_stream(0, tx);
        assert!(token.is_stream());
        assert!(map.deliver(token, packet()));
        assert!(map.deliver(token, packet()));
        assert_eq!(rx.try_recv().unwrap().payload, Bytes::from_static(b"hi"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_reply_is_one_shot() {
        let mut map = EndpointMap::new();
        let (tx, mut rx) = oneshot::channel();
        let token = map.insert_reply(tx);
        assert!(!token.is_stream());
        assert!(map.deliver(token, packet()));
        assert!(rx.try_recv().is_ok());
        // Second delivery misses: the slot is gone.
        assert!(!map.deliver(token, packet()));
    }

    #[test]
    fn test_stale_token_misses_reused_slot() {
        let mut map = EndpointMap::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let old = map.insert_stream(0, tx);
        map.remove(old);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let new = map.insert_stream(0, tx2);
        // Slot index is reused but the first word differs.
        assert_eq!(old.index(), new.index());
        assert!(!map.deliver(old, packet()));
        assert!(map.deliver(new, packet()));
    }

    #[test]
    fn test_unknown_token_misses() {
        let mut map = EndpointMap::new();
        let bogus = Token::new(123, 999, 0, true);
        assert!(!map.deliver(bogus, packet()));
    }

    #[test]
    fn test_dropped_stream_receiver_retires_slot() {
        let mut map = EndpointMap::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = map.insert_stream(0, tx);
        drop(rx);
        assert!(!map.deliver(token, packet()));
        assert!(!map.deliver(token, packet()));
    }
}
