//! Per-session state and the process-wide session table.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use protocol::TimePing;
use rand::Rng;
use tokio::{net::UdpSocket, sync::Notify};

use crate::ack_ring::AckRing;

/// How long a session may sit with `tcp_activated` but no UDP handshake
/// before it is garbage collected. See DESIGN.md for the 20s-vs-60s
/// resolution.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a session may go without a valid inbound ping before it is
/// considered dead, in both the send loop's self-termination check and
/// the GC sweep.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Coarse view of where a session sits in its lifecycle, for logging and
/// metrics labeling. A fully closed session has no runtime representation
/// here — it's simply absent from the [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    TcpOnly,
    Established,
}

/// Generates a session identifier the way the invitee does: a fresh
/// random 32-bit value. Collisions against the live table are handled by
/// the caller retrying — at most one session per id.
pub fn random_session_id() -> u32 {
    rand::thread_rng().gen()
}

struct Inner {
    last_rx: Instant,
    last_rx_ping: Option<TimePing>,
    current_id: u8,
    ack_ring: AckRing,
    reply_to: SocketAddr,
    reply_socket: Option<Arc<UdpSocket>>,
}

/// The central entity: a duplex measurement relationship with one peer,
/// identified by `session_id`.
///
/// Atomics guard the two liveness flags since they're read from many
/// tasks (send loop, receive path, GC) without needing the full lock;
/// everything else that the receive path writes and the send loop reads
/// lives behind `inner`, giving the happens-before relation required
/// between a receive-path update and the next send-loop read.
pub struct Session {
    pub session_id: u32,
    pub peer_address: IpAddr,
    pub made_by_me: bool,
    pub created_at: Instant,
    tcp_activated: AtomicBool,
    udp_activated: AtomicBool,
    next_tx_id: AtomicU8,
    inner: parking_lot::Mutex<Inner>,

    /// Fires exactly once, when the UDP handshake completes. Built on
    /// [`Notify`], whose "at most one outstanding permit" behavior already
    /// gives the single-slot, drop-if-full semantics this signal needs.
    pub udp_handshake_signal: Notify,
    /// Fires once per 1 Hz tick, fanned out by the clock service.
    pub tick_signal: Notify,
}

impl Session {
    /// Builds a session with `tcp_activated` already set — both creation
    /// paths (inbound INVITE, outbound dial) only construct a `Session`
    /// after their TCP exchange has already succeeded.
    pub fn new(session_id: u32, peer_address: IpAddr, made_by_me: bool) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            session_id,
            peer_address,
            made_by_me,
            created_at: now,
            tcp_activated: AtomicBool::new(true),
            udp_activated: AtomicBool::new(false),
            next_tx_id: AtomicU8::new(0),
            inner: parking_lot::Mutex::new(Inner {
                last_rx: now,
                last_rx_ping: None,
                current_id: 0,
                ack_ring: AckRing::new(),
                reply_to: SocketAddr::new(peer_address, protocol::DEFAULT_PORT),
                reply_socket: None,
            }),
            udp_handshake_signal: Notify::new(),
            tick_signal: Notify::new(),
        })
    }

    pub fn is_tcp_activated(&self) -> bool {
        self.tcp_activated.load(Ordering::Acquire)
    }

    pub fn is_udp_activated(&self) -> bool {
        self.udp_activated.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.is_udp_activated() {
            SessionState::Established
        } else {
            SessionState::TcpOnly
        }
    }

    /// Handles an inbound UDP handshake packet (`Type='h'`).
    ///
    /// Returns `true` the first time this is called for the session (the
    /// caller should reflect the handshake back to the sender exactly
    /// once); returns `false` on every subsequent handshake retransmit,
    /// which is dropped without a reply.
    pub fn activate_udp(&self, reply_to: SocketAddr, reply_socket: Arc<UdpSocket>) -> bool {
        let first = self
            .udp_activated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        {
            let mut inner = self.inner.lock();
            inner.reply_to = reply_to;
            inner.reply_socket = Some(reply_socket);
        }

        self.udp_handshake_signal.notify_one();
        first
    }

    /// Records a validly received time ping: advances the ack ring,
    /// updates `last_rx`/`last_rx_ping`, and — since the source address
    /// may have changed as the peer roams across a NAT rebind — updates
    /// `reply_to`/`reply_socket` from the observed datagram.
    pub fn record_ping(&self, pkt: &TimePing, rx_millis: i64, src: SocketAddr, rx_socket: Arc<UdpSocket>) {
        let record = protocol::AckRecord {
            id: pkt.id,
            tx_millis: pkt.tx_millis,
            rx_millis,
        };

        let mut inner = self.inner.lock();
        inner.ack_ring.push(record);
        inner.last_rx = Instant::now();
        inner.last_rx_ping = Some(pkt.clone());
        inner.reply_to = src;
        inner.reply_socket = Some(rx_socket);
    }

    /// The address and socket the send loop should transmit the next
    /// ping to — the most recently observed source, which may differ
    /// from the address the session was created with.
    pub fn reply_target(&self) -> (SocketAddr, Option<Arc<UdpSocket>>) {
        let inner = self.inner.lock();
        (inner.reply_to, inner.reply_socket.clone())
    }

    /// A snapshot of the ack ring for embedding in an outbound ping.
    pub fn ack_snapshot(&self) -> Vec<protocol::AckRecord> {
        self.inner.lock().ack_ring.snapshot()
    }

    /// The most recently received, fully parsed ping — exposed for
    /// metrics scraping.
    pub fn last_rx_ping(&self) -> Option<TimePing> {
        self.inner.lock().last_rx_ping.clone()
    }

    /// A read-locked view of the local ack ring, for stats derivation.
    pub fn with_ack_ring<R>(&self, f: impl FnOnce(&AckRing) -> R) -> R {
        f(&self.inner.lock().ack_ring)
    }

    pub fn record_transmitted_id(&self, id: u8) {
        self.next_tx_id.store(id, Ordering::Release);
        self.inner.lock().current_id = id;
    }

    pub fn last_transmitted_id(&self) -> u8 {
        self.next_tx_id.load(Ordering::Acquire)
    }

    fn last_rx_instant(&self) -> Instant {
        self.inner.lock().last_rx
    }

    /// `now − createdAt > 60s && !udp_activated` — the handshake never
    /// completed in time.
    pub fn handshake_timed_out(&self, now: Instant) -> bool {
        !self.is_udp_activated() && now.saturating_duration_since(self.created_at) > HANDSHAKE_TIMEOUT
    }

    /// `now − lastRX > 60s` — no valid ping in the idle window, used by
    /// both the send loop's self-termination check and the GC sweep.
    pub fn rx_is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_rx_instant()) > IDLE_TIMEOUT
    }

    /// Whether this session should be reaped by the GC sweep.
    pub fn should_gc(&self, now: Instant) -> bool {
        self.handshake_timed_out(now) || (self.is_udp_activated() && self.rx_is_stale(now))
    }
}

/// Process-wide registry of active sessions, keyed by `session_id`.
///
/// A single exclusive lock serializes inserts/removes/enumeration; this
/// is deliberately not on the hot send/receive path for an established
/// session — lookups by id are the hot path and still take the lock, but
/// it is held only for a hashmap probe.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a session by id. The hot path for every inbound datagram.
    pub fn get(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Inserts a session created from an inbound TCP invite, generating
    /// session ids until a free one is found (at most one session per
    /// id).
    pub fn insert_invitee(&self, peer_address: IpAddr) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        loop {
            let id = random_session_id();
            if !sessions.contains_key(&id) {
                let session = Session::new(id, peer_address, false);
                sessions.insert(id, session.clone());
                return session;
            }
        }
    }

    /// Inserts a session for an outbound dial, where the session id was
    /// already allocated by the remote invitee.
    pub fn insert_inviter(&self, session_id: u32, peer_address: IpAddr) -> Arc<Session> {
        let session = Session::new(session_id, peer_address, true);
        self.sessions.write().insert(session_id, session.clone());
        session
    }

    pub fn remove(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.write().remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live sessions, for ticker fan-out and metrics scraping.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Removes every session that meets its GC condition, returning how
    /// many were reaped. Run once a minute by the GC task.
    pub fn gc_sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let dead: Vec<u32> = sessions
            .iter()
            .filter(|(_, s)| s.should_gc(now))
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            sessions.remove(id);
        }

        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn session_starts_tcp_only_and_activates_once() {
        let session = Session::new(1, IpAddr::V4(Ipv4Addr::LOCALHOST), true);
        assert_eq!(session.state(), SessionState::TcpOnly);

        let socket_addr: SocketAddr = "127.0.0.1:6924".parse().unwrap();
        // We can't easily construct a real UdpSocket synchronously in a
        // plain #[test]; the handshake-reflection behavior itself (first
        // call true, later calls false) doesn't depend on the socket, so
        // it's exercised in the async test below via a bound socket.
        let _ = socket_addr;
    }

    #[tokio::test]
    async fn handshake_reflects_exactly_once() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:6924".parse().unwrap();

        let session = Session::new(1, IpAddr::V4(Ipv4Addr::LOCALHOST), true);
        assert!(session.activate_udp(peer, socket.clone()));
        assert!(session.state() == SessionState::Established);
        assert!(!session.activate_udp(peer, socket));
    }

    #[test]
    fn gc_reaps_idle_handshake_and_idle_rx() {
        let session = Session::new(1, IpAddr::V4(Ipv4Addr::LOCALHOST), true);
        let far_future = session.created_at + Duration::from_secs(120);
        assert!(session.should_gc(far_future));
    }

    #[test]
    fn table_insert_lookup_and_gc_roundtrip() {
        let table = SessionTable::new();
        let session = table.insert_invitee(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let id = session.session_id;

        assert!(table.get(id).is_some());
        assert_eq!(table.len(), 1);

        let future = Instant::now() + Duration::from_secs(120);
        let reaped = table.gc_sweep(future);
        assert_eq!(reaped, 1);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn session_id_is_reallocatable_after_gc() {
        let table = SessionTable::new();
        let session = table.insert_inviter(42, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(session.session_id, 42);

        table.remove(42);
        let reused = table.insert_inviter(42, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(reused.session_id, 42);
    }
}
