//! MessagePack packet shapes exchanged over UDP.
//!
//! Fields are tagged with single-character names on the wire (`Y`, `M`,
//! `S`, ...) to keep packets compact; structs are serialized as MessagePack
//! maps (`with_struct_map`) rather than the crate default of positional
//! arrays, since the wire contract is keyed.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Gate value every packet must carry. Not a secret — just enough to make
/// a stray unrelated datagram on the same port drop instead of corrupting
/// session state.
pub const MAGIC: u32 = 11181;

/// The only protocol version this crate speaks. Three incompatible wire
/// revisions have existed historically; this crate implements the
/// latest.
pub const VERSION: u8 = 3;

const KIND_HANDSHAKE: u8 = b'h';
const KIND_TIME_PING: u8 = b't';

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode packet: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode packet: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unknown packet kind: {0:?}")]
    UnknownKind(u8),
}

/// One observation of a received ping: the id the sender chose, the
/// sender's corrected transmit time, and the receiver's corrected receive
/// time.
///
/// `id == 0` is the sentinel for "this ack-ring slot has never been
/// written" — well-formed senders never produce it (see
/// [`crate::sequence_id`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    #[serde(rename = "R")]
    pub id: u8,
    /// Sender's corrected transmit time, milliseconds since the Unix epoch.
    #[serde(rename = "U")]
    pub tx_millis: i64,
    /// Receiver's corrected receive time, milliseconds since the Unix epoch.
    #[serde(rename = "X")]
    pub rx_millis: i64,
}

impl AckRecord {
    pub const EMPTY: AckRecord = AckRecord {
        id: 0,
        tx_millis: 0,
        rx_millis: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.id == 0 || self.rx_millis == 0
    }
}

impl Default for AckRecord {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// UDP handshake packet. Reflected exactly once by the receiver on first
/// arrival; its presence is what moves a session from `TCPONLY` to
/// `ESTABLISHED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "Y")]
    kind: u8,
    #[serde(rename = "M")]
    pub magic: u32,
    #[serde(rename = "V")]
    pub version: u8,
    #[serde(rename = "S")]
    pub session: u32,
}

impl Handshake {
    pub fn new(session: u32) -> Self {
        Self {
            kind: KIND_HANDSHAKE,
            magic: MAGIC,
            version: VERSION,
            session,
        }
    }
}

/// Steady-state timestamped ping, carrying a snapshot of the sender's ack
/// ring so the receiver can derive loss in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePing {
    #[serde(rename = "Y")]
    kind: u8,
    #[serde(rename = "M")]
    pub magic: u32,
    #[serde(rename = "S")]
    pub session: u32,
    #[serde(rename = "I")]
    pub id: u8,
    /// Sender's corrected transmit time, milliseconds since the Unix epoch.
    #[serde(rename = "T")]
    pub tx_millis: i64,
    /// Sender's estimate of its own residual clock error, in milliseconds.
    /// Informational only; not used by stats derivation.
    #[serde(rename = "E")]
    pub senders_error_millis: i64,
    #[serde(rename = "A")]
    pub last_acks: Vec<AckRecord>,
}

impl TimePing {
    pub fn new(
        session: u32,
        id: u8,
        tx_millis: i64,
        senders_error_millis: i64,
        last_acks: Vec<AckRecord>,
    ) -> Self {
        Self {
            kind: KIND_TIME_PING,
            magic: MAGIC,
            session,
            id,
            tx_millis,
            senders_error_millis,
            last_acks,
        }
    }
}

/// Either of the two packet shapes this protocol speaks, after the `Y`
/// discriminant has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    TimePing(TimePing),
}

#[derive(Deserialize)]
struct KindProbe {
    #[serde(rename = "Y")]
    kind: u8,
}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    value.serialize(&mut rmp_serde::Serializer::new(&mut buf).with_struct_map())?;
    Ok(buf)
}

fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    let mut de = rmp_serde::Deserializer::new(bytes);
    T::deserialize(&mut de).map_err(Error::from)
}

impl Handshake {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        to_vec(self)
    }
}

impl TimePing {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        to_vec(self)
    }
}

/// Decodes a datagram into one of the two packet shapes.
///
/// Returns `Err` on anything malformed or of unrecognized kind; callers
/// are expected to drop the datagram silently rather than propagate the
/// error — malformed datagrams are logged at debug and dropped, never
/// fatal.
pub fn decode(bytes: &[u8]) -> Result<Packet, Error> {
    let probe: KindProbe = from_slice(bytes)?;
    match probe.kind {
        KIND_HANDSHAKE => Ok(Packet::Handshake(from_slice(bytes)?)),
        KIND_TIME_PING => Ok(Packet::TimePing(from_slice(bytes)?)),
        other => Err(Error::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let hs = Handshake::new(0x1234_5678);
        let bytes = hs.encode().unwrap();
        match decode(&bytes).unwrap() {
            Packet::Handshake(decoded) => assert_eq!(decoded, hs),
            Packet::TimePing(_) => panic!("decoded as the wrong variant"),
        }
    }

    #[test]
    fn time_ping_round_trips_with_acks() {
        let acks = vec![
            AckRecord {
                id: 5,
                tx_millis: 1000,
                rx_millis: 1020,
            },
            AckRecord::EMPTY,
        ];

        let ping = TimePing::new(42, 17, 5_000, -3, acks.clone());
        let bytes = ping.encode().unwrap();

        match decode(&bytes).unwrap() {
            Packet::TimePing(decoded) => assert_eq!(decoded, ping),
            Packet::Handshake(_) => panic!("decoded as the wrong variant"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        #[derive(Serialize)]
        struct Bogus {
            #[serde(rename = "Y")]
            kind: u8,
        }

        let mut buf = Vec::new();
        Bogus { kind: b'z' }
            .serialize(&mut rmp_serde::Serializer::new(&mut buf).with_struct_map())
            .unwrap();

        assert!(matches!(decode(&buf), Err(Error::UnknownKind(b'z'))));
    }

    #[test]
    fn ack_record_empty_sentinel() {
        assert!(AckRecord::EMPTY.is_empty());
        assert!(AckRecord {
            id: 0,
            tx_millis: 5,
            rx_millis: 5
        }
        .is_empty());
        assert!(!AckRecord {
            id: 3,
            tx_millis: 5,
            rx_millis: 5
        }
        .is_empty());
    }
}
