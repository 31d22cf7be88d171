//! TagLog Server
//!
//! The transaction-log role of a taglog cluster: a durable, versioned,
//! tagged message queue. Commit coordinators push version-ordered batches
//! of tagged mutations; storage replicas subscribe per tag, peeking from
//! the version they last saw and popping once they have made data durable
//! themselves.
//!
//! ## Steady-state data flow
//!
//! ```text
//! commit ──► commit path ──► tag-indexed memory log ──► peeks (memory)
//!                 │
//!                 ▼
//!            log queue (disk, fsync)      spill loop
//!                 │                           │ value- or reference-
//!                 └──────── replayed ◄──┐     ▼ spill
//!                          on restart   │  KV index ──► peeks (spilled)
//!                                       │     │
//!                                       └─ pops trim both
//! ```
//!
//! A server hosts one **generation** of the log per recruitment epoch;
//! older generations stick around, stopped, until every subscriber has
//! popped past their data, then retire. When the last generation retires
//! the process's role ends with `worker_removed`.
//!
//! The modules map onto the subsystems: [`generation`] (per-generation
//! state and the in-memory tag log), [`commit`] (admission and queue
//! durability), [`spill`] (moving old versions into the KV index and
//! reclaiming the disk queue), [`peek`] (subscriber reads and pops),
//! [`recovery`] (startup replay) and [`server`] (RPC wiring and
//! lifecycle).

pub mod client;
pub mod commit;
pub mod config;
pub mod error;
pub mod generation;
pub mod peek;
pub mod recovery;
pub mod rpc;
pub mod server;
pub mod spill;

pub use client::TLogClient;
pub use config::{Knobs, ServerConfig};
pub use error::{Error, Result};
pub use rpc::TLogInterface;
pub use server::TLogServer;
