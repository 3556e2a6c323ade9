//! Session state machine, ack ring, and stats derivation for splitping.
//!
//! This crate holds everything about a session that can be reasoned about
//! without a running clock service or live sockets: the circular ack
//! buffer, the RX/TX latency and loss math, and the session record itself
//! with its lifecycle/GC predicates. The engine that drives ticks,
//! handshake retries, and socket I/O lives in the `splitping` binary
//! crate, which holds `Session`s behind `Arc` and calls into this crate's
//! pure functions.

pub mod ack_ring;
pub mod session;
pub mod stats;

pub use ack_ring::AckRing;
pub use session::{random_session_id, Session, SessionState, SessionTable, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT};
pub use stats::{loss, rx_latency_millis, tx_latency_millis, Loss};
