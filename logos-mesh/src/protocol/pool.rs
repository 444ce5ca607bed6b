//! Reusable encode buffers.
//!
//! A fixed ring of `Vec<u8>` slots indexed by a rotating cursor. Each call
//! to [`EncodePool::encode`] clears the next slot, encodes into it and
//! returns a borrowed view. The borrow ties the view to the pool, so a
//! caller that wants to keep the bytes past the next encode must copy them.
//!
//! Performance target: steady-state encoding without reallocation once each
//! slot has grown to the working packet size.

use super::packet::WirePacket;

pub const DEFAULT_POOL_SLOTS: usize = 8;

pub struct EncodePool {
    slots: Vec<Vec<u8>>,
    cursor: usize,
}

impl EncodePool {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| Vec::with_capacity(256)).collect(),
            cursor: 0,
        }
    }

    /// Encode into the next slot. The returned slice is valid until the
    /// pool is used again.
    pub fn encode(&mut self, packet: &WirePacket) -> &[u8] {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = &mut self.slots[idx];
        packet.encode_into(slot);
        slot.as_slice()
    }

}

impl Default for EncodePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::PingPacket;

    #[test]
    fn test_encode_matches_owned_encode() {
        let mut pool = EncodePool::new(2);
        let packet = WirePacket::Ping(PingPacket { request_id: 3, sent_at: 4 });
        let view = pool.encode(&packet).to_vec();
        assert_eq!(view, packet.encode());
    }

    #[test]
    fn test_cursor_rotates() {
        let mut pool = EncodePool::new(3);
        for i in 0..7 {
            pool.encode(&WirePacket::Sync(vec![i]));
        }
        assert_eq!(pool.cursor, 7 % 3);
    }

    #[test]
    fn test_zero_slots_clamped() {
        let mut pool = EncodePool::new(0);
        assert_eq!(pool.slots.len(), 1);
        assert_eq!(pool.encode(&WirePacket::Sync(vec![1])), WirePacket::Sync(vec![1]).encode());
    }
}
