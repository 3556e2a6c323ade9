//! Derivation of per-direction latency and loss from a received ping plus
//! the local ack ring.
//!
//! Every function here is pure: no clock, no sockets, no locks. The engine
//! supplies already-corrected millisecond timestamps and a snapshot of the
//! relevant ack data; these functions just do the arithmetic, which is what
//! makes them cheap to property-test.

use protocol::AckRecord;

use crate::ack_ring::{contains_id, AckRing};

/// Loss tallied over a ~32-exchange window. `exchanges` is always 0 (not
/// enough data yet) or 32 (a full window) — never anything in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loss {
    pub rx_loss: u32,
    pub tx_loss: u32,
    pub exchanges: u32,
}

impl Loss {
    pub const INSUFFICIENT: Loss = Loss {
        rx_loss: 0,
        tx_loss: 0,
        exchanges: 0,
    };
}

/// Forward-direction latency: the peer's transmit timestamp subtracted
/// from our corrected receive timestamp.
///
/// Negative results are meaningful, not an error — they indicate the local
/// clock trails the peer's, or that true one-way latency is smaller than
/// the residual clock skew. Callers report this as-is.
pub fn rx_latency_millis(rx_pkt_tx_millis: i64, local_rx_millis: i64) -> i64 {
    local_rx_millis - rx_pkt_tx_millis
}

/// Reverse-direction latency: the peer's locally measured reception of our
/// most recently transmitted packet, read out of the acks the peer echoed
/// back to us.
///
/// The selection is "the ack whose `tx` is most recent (smallest `now() −
/// tx`)"; since `now()` is constant across the scan, that is equivalent
/// to the ack with the largest `tx_millis`, which is what this scans for
/// directly.
pub fn tx_latency_millis(peer_last_acks: &[AckRecord]) -> Option<i64> {
    peer_last_acks
        .iter()
        .filter(|ack| !ack.is_empty())
        .max_by_key(|ack| ack.tx_millis)
        .map(|ack| ack.rx_millis - ack.tx_millis)
}

/// Loss over the last ~32 exchanges, from our perspective.
///
/// `local_ring` is what we received from the peer; `peer_last_acks` is the
/// ack snapshot the peer just sent us (their view of what they received
/// from us). `now_unix_secs` should be corrected-clock seconds, used only
/// to locate the current wire id window.
pub fn loss(now_unix_secs: i64, local_ring: &AckRing, peer_last_acks: &[AckRecord]) -> Loss {
    if local_ring.has_empty_slot() {
        return Loss::INSUFFICIENT;
    }

    let tip_id = protocol::sequence_id(now_unix_secs) as i32;
    let mut rx_loss = 0u32;
    let mut tx_loss = 0u32;

    // The 31 ids immediately preceding tip_id, wrapping mod 256 and
    // skipping 0 (the empty-slot sentinel, never a valid wire id). See
    // DESIGN.md for why 31 rather than 32 comparisons.
    for back in 1..=31i32 {
        let id = (tip_id - back).rem_euclid(256) as u8;
        if id == 0 {
            continue;
        }
        if !contains_id(peer_last_acks, id) {
            tx_loss += 1;
        }
        if !local_ring.contains_id(id) {
            rx_loss += 1;
        }
    }

    Loss {
        rx_loss,
        tx_loss,
        exchanges: 32,
    }
}
