//! Hybrid logical clock.
//!
//! Packing (128 bits, big end first):
//! ```text
//! ┌────────────────────┬──────────────┬──────────────────────┐
//! │ physical ms (48)   │ logical (16) │ node id (64)         │
//! └────────────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Comparing the packed integers gives the total order used to resolve
//! concurrent writes: wall time, then logical counter, then node id as the
//! tie-breaker.
//!
//! Reference: Kulkarni et al. — Logical Physical Clocks (2014)

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

const PHYSICAL_MASK: u64 = (1 << 48) - 1;

/// A single HLC reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HlcTimestamp {
    /// Milliseconds since the Unix epoch (low 48 bits kept).
    pub physical: u64,
    pub logical: u16,
    /// Stable per-actor identifier, see [`node_id`].
    pub node: u64,
}

impl HlcTimestamp {
    pub fn new(physical: u64, logical: u16, node: u64) -> Self {
        Self {
            physical: physical & PHYSICAL_MASK,
            logical,
            node,
        }
    }

    pub fn to_u128(self) -> u128 {
        ((self.physical & PHYSICAL_MASK) as u128) << 80
            | (self.logical as u128) << 64
            | self.node as u128
    }

    pub fn from_u128(v: u128) -> Self {
        Self {
            physical: (v >> 80) as u64 & PHYSICAL_MASK,
            logical: (v >> 64) as u16,
            node: v as u64,
        }
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_u128().cmp(&other.to_u128())
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// FNV-1a hash of an actor id, used as the HLC node component.
pub fn node_id(actor: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in actor.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-client clock. Never goes backwards, even if the wall clock does.
#[derive(Debug, Clone)]
pub struct HlcClock {
    node: u64,
    last: HlcTimestamp,
}

impl HlcClock {
    pub fn new(actor: &str) -> Self {
        let node = node_id(actor);
        Self {
            node,
            last: HlcTimestamp::new(0, 0, node),
        }
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    /// Timestamp for a local event.
    pub fn now(&mut self) -> HlcTimestamp {
        self.tick(wall_clock_ms())
    }

    /// Timestamp for a local event at an explicit wall time.
    pub fn tick(&mut self, wall_ms: u64) -> HlcTimestamp {
        let wall = wall_ms & PHYSICAL_MASK;
        let next = if wall > self.last.physical {
            HlcTimestamp::new(wall, 0, self.node)
        } else {
            self.bump(self.last.physical, self.last.logical)
        };
        self.last = next;
        next
    }

    /// Merge a remote timestamp so later local events sort after it.
    pub fn observe(&mut self, remote: HlcTimestamp) -> HlcTimestamp {
        self.observe_at(remote, wall_clock_ms())
    }

    pub fn observe_at(&mut self, remote: HlcTimestamp, wall_ms: u64) -> HlcTimestamp {
        let wall = wall_ms & PHYSICAL_MASK;
        let physical = wall.max(self.last.physical).max(remote.physical);
        let next = if physical == self.last.physical && physical == remote.physical {
            self.bump(physical, self.last.logical.max(remote.logical))
        } else if physical == self.last.physical {
            self.bump(physical, self.last.logical)
        } else if physical == remote.physical {
            self.bump(physical, remote.logical)
        } else {
            HlcTimestamp::new(physical, 0, self.node)
        };
        self.last = next;
        next
    }

    fn bump(&self, physical: u64, logical: u16) -> HlcTimestamp {
        match logical.checked_add(1) {
            Some(l) => HlcTimestamp::new(physical, l, self.node),
            // Counter exhausted within one millisecond: borrow from the future.
            None => HlcTimestamp::new(physical + 1, 0, self.node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let ts = HlcTimestamp::new(1_700_000_000_123, 42, 0xDEAD_BEEF_0000_0001);
        assert_eq!(HlcTimestamp::from_u128(ts.to_u128()), ts);
    }

    #[test]
    fn test_order_by_physical_then_logical_then_node() {
        let a = HlcTimestamp::new(10, 5, 99);
        let b = HlcTimestamp::new(11, 0, 1);
        let c = HlcTimestamp::new(11, 1, 0);
        let d = HlcTimestamp::new(11, 1, 7);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_clock_monotonic_when_wall_stalls() {
        let mut clock = HlcClock::new("peer-a");
        let t1 = clock.tick(1000);
        let t2 = clock.tick(1000);
        let t3 = clock.tick(999); // wall clock went backwards
        assert!(t1 < t2);
        assert!(t2 < t3);
        assert_eq!(t3.physical, 1000);
        assert_eq!(t3.logical, 2);
    }

    #[test]
    fn test_observe_remote_ahead() {
        let mut clock = HlcClock::new("peer-a");
        clock.tick(1000);
        let remote = HlcTimestamp::new(5000, 3, node_id("peer-b"));
        let merged = clock.observe_at(remote, 1200);
        assert_eq!(merged.physical, 5000);
        assert_eq!(merged.logical, 4);
        assert!(clock.tick(1300) > remote);
    }

    #[test]
    fn test_logical_overflow_rolls_physical() {
        let mut clock = HlcClock::new("peer-a");
        clock.last = HlcTimestamp::new(100, u16::MAX, clock.node());
        let next = clock.tick(100);
        assert_eq!(next.physical, 101);
        assert_eq!(next.logical, 0);
    }

    #[test]
    fn test_node_id_stable() {
        assert_eq!(node_id("peer-a"), node_id("peer-a"));
        assert_ne!(node_id("peer-a"), node_id("peer-b"));
    }
}
