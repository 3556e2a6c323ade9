//! The 32-slot circular buffer of recently received pings.
//!
//! Reuses [`protocol::AckRecord`] as the in-memory record shape — it is
//! already `{id, tx_millis, rx_millis}`, identical to what the wire format
//! carries, so there is no separate "session-side" record type to keep in
//! sync with the codec.

use protocol::{AckRecord, ACK_RING_SIZE};

/// Circular buffer of the most recently received [`AckRecord`]s for one
/// session.
///
/// `next_slot` always advances `(n + 1) mod 32` and is never reset except
/// by constructing a fresh ring.
#[derive(Debug, Clone)]
pub struct AckRing {
    slots: [AckRecord; ACK_RING_SIZE],
    next_slot: usize,
}

impl Default for AckRing {
    fn default() -> Self {
        Self {
            slots: [AckRecord::EMPTY; ACK_RING_SIZE],
            next_slot: 0,
        }
    }
}

impl AckRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `record` into the next slot and advances the cursor.
    pub fn push(&mut self, record: AckRecord) {
        self.slots[self.next_slot] = record;
        self.next_slot = (self.next_slot + 1) % ACK_RING_SIZE;
    }

    /// The slot index the next `push` will write to, always `0..32`.
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    /// A snapshot of the ring contents in storage order, suitable for
    /// embedding in an outbound [`protocol::TimePing::last_acks`].
    ///
    /// Concurrent writes during the snapshot are tolerated as a torn
    /// read — callers that need a consistent view take the per-session
    /// lock around both the writes and this call.
    pub fn snapshot(&self) -> Vec<AckRecord> {
        self.slots.to_vec()
    }

    /// Whether any slot still holds the sentinel-empty value, i.e. the ring
    /// has not yet been fully populated since session start.
    pub fn has_empty_slot(&self) -> bool {
        self.slots.iter().any(AckRecord::is_empty)
    }

    /// Whether a non-empty record with the given wire `id` is present
    /// anywhere in the ring. Order is irrelevant.
    pub fn contains_id(&self, id: u8) -> bool {
        contains_id(&self.slots, id)
    }
}

/// Same membership test as [`AckRing::contains_id`], over an arbitrary
/// slice — used for scanning a peer's transmitted `last_acks` snapshot,
/// which is a `Vec<AckRecord>` rather than a full ring.
pub fn contains_id(records: &[AckRecord], id: u8) -> bool {
    id != 0 && records.iter().any(|r| !r.is_empty() && r.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u8) -> AckRecord {
        AckRecord {
            id,
            tx_millis: id as i64 * 1000,
            rx_millis: id as i64 * 1000 + 20,
        }
    }

    #[test]
    fn next_slot_stays_in_range_and_wraps() {
        let mut ring = AckRing::new();
        for n in 0..100u8 {
            assert!(ring.next_slot() < ACK_RING_SIZE);
            ring.push(rec(n.max(1)));
        }
        assert!(ring.next_slot() < ACK_RING_SIZE);
    }

    #[test]
    fn retains_most_recent_min_n_32_records() {
        let mut ring = AckRing::new();
        // Fewer than 32 pushes: ring retains exactly those, rest empty.
        for n in 1..=5u8 {
            ring.push(rec(n));
        }
        assert!(ring.has_empty_slot());
        assert!(ring.contains_id(1));
        assert!(ring.contains_id(5));
        assert!(!ring.contains_id(6));

        // Now overflow the ring: ids 1..=5 must be evicted once 32 more
        // pushes have landed (40 total pushes, ring size 32).
        let mut ring = AckRing::new();
        for n in 1..=40u8 {
            ring.push(rec(n));
        }
        assert!(!ring.has_empty_slot());
        assert!(!ring.contains_id(1));
        assert!(!ring.contains_id(8));
        assert!(ring.contains_id(9));
        assert!(ring.contains_id(40));
    }

    #[test]
    fn id_zero_is_never_a_match() {
        let ring = AckRing::new();
        assert!(!ring.contains_id(0));
        assert!(!contains_id(&[AckRecord::EMPTY], 0));
    }
}
