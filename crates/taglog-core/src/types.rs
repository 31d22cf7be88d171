//! Versions, identifiers and storage accounting.
//!
//! ## Version
//! A `Version` is the 64-bit commit ordinal assigned by the commit
//! coordinator. Version `0` is never assigned; it is the initial value of
//! every popped/durable counter, so "popped at 0" means "nothing popped".
//!
//! ## Uid
//! A 128-bit random identifier, printed as 32 hex digits. Used for log
//! generations, peek subscribers, connections and operator commands. The
//! byte form is big-endian so that Uids sort the same as their hex strings,
//! which matters for the KV index key namespace.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Commit ordinal assigned by the coordinator. Strictly increasing within a
/// generation.
pub type Version = u64;

/// Wire protocol version. The low 16 bits carry patch-level changes that do
/// not break compatibility; everything above must match for two processes to
/// exchange messages.
pub const PROTOCOL_VERSION: u64 = 0x5447_4C00_0400_0001;

/// Mask applied to both sides before a compatibility comparison.
pub const PROTOCOL_VERSION_COMPATIBLE_MASK: u64 = 0xFFFF_FFFF_FFFF_0000;

/// True if two protocol versions can exchange messages.
pub fn protocol_compatible(a: u64, b: u64) -> bool {
    a & PROTOCOL_VERSION_COMPATIBLE_MASK == b & PROTOCOL_VERSION_COMPATIBLE_MASK
}

/// 128-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub first: u64,
    pub second: u64,
}

impl Uid {
    pub const ZERO: Uid = Uid {
        first: 0,
        second: 0,
    };

    pub fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Generate a random identifier.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            first: rng.next_u64(),
            second: rng.next_u64(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.first == 0 && self.second == 0
    }

    /// Big-endian 16-byte form, sorts like the hex string.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.first.to_be_bytes());
        out[8..].copy_from_slice(&self.second.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&bytes[..8]);
        second.copy_from_slice(&bytes[8..]);
        Self {
            first: u64::from_be_bytes(first),
            second: u64::from_be_bytes(second),
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Disk usage snapshot reported by the disk queue and the KV index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBytes {
    /// Bytes not yet claimed by any file.
    pub free: u64,
    /// Configured capacity.
    pub total: u64,
    /// Bytes held by live files.
    pub used: u64,
    /// Bytes a writer may still consume (`free` minus reservations).
    pub available: u64,
}

impl StorageBytes {
    pub fn for_used(used: u64, total: u64) -> Self {
        let free = total.saturating_sub(used);
        Self {
            free,
            total,
            used,
            available: free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_roundtrip_bytes() {
        let uid = Uid::new(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        assert_eq!(Uid::from_bytes(uid.to_bytes()), uid);
    }

    #[test]
    fn test_uid_bytes_sort_like_display() {
        let a = Uid::new(1, u64::MAX);
        let b = Uid::new(2, 0);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_uid_display_width() {
        assert_eq!(Uid::ZERO.to_string().len(), 32);
        assert_eq!(Uid::new(1, 2).to_string(), format!("{:016x}{:016x}", 1, 2));
    }

    #[test]
    fn test_uid_random_is_not_zero() {
        // Astronomically unlikely to collide with zero.
        assert!(!Uid::random().is_zero());
        assert_ne!(Uid::random(), Uid::random());
    }

    #[test]
    fn test_protocol_compatible_ignores_patch_bits() {
        assert!(protocol_compatible(PROTOCOL_VERSION, PROTOCOL_VERSION | 0xFFFF));
        assert!(!protocol_compatible(
            PROTOCOL_VERSION,
            PROTOCOL_VERSION + 0x1_0000
        ));
    }

    #[test]
    fn test_storage_bytes_for_used() {
        let s = StorageBytes::for_used(100, 1000);
        assert_eq!(s.used, 100);
        assert_eq!(s.free, 900);
        assert_eq!(s.available, 900);
        assert_eq!(s.total, 1000);
    }

    #[test]
    fn test_storage_bytes_saturates_when_over_capacity() {
        let s = StorageBytes::for_used(2000, 1000);
        assert_eq!(s.free, 0);
        assert_eq!(s.available, 0);
    }
}
