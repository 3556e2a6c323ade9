//! The per-session engine: handshake loop, send loop, and the receive-path
//! handling that updates a session's ack ring and derives stats.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use protocol::Packet;
use session::{Session, SessionTable};
use tokio::{net::UdpSocket, time::Duration};

use crate::clock::Clock;

/// How long the inviter retries handshakes / either side waits for one
/// before giving up.
const HANDSHAKE_GIVE_UP: Duration = Duration::from_secs(60);
/// The send loop tolerates staleness only after it's been running this
/// long, so a session that never receives anything right after the
/// handshake still gets one grace window.
const SEND_LOOP_GRACE: Duration = Duration::from_secs(10);

/// Dispatches one admitted, parsed datagram to the owning session.
///
/// Every branch here either drops silently or acts; nothing propagates an
/// error out across the task boundary.
pub async fn handle_datagram(
    bytes: &[u8],
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    table: Arc<SessionTable>,
    clock: Arc<Clock>,
) {
    let packet = match protocol::decode(bytes) {
        Ok(packet) => packet,
        Err(e) => {
            log::debug!("malformed datagram from {src}: {e}");
            return;
        }
    };

    match packet {
        Packet::Handshake(hs) => handle_handshake(hs, src, socket, table).await,
        Packet::TimePing(ping) => handle_time_ping(ping, src, socket, table, clock).await,
    }
}

async fn handle_handshake(
    hs: protocol::Handshake,
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    table: Arc<SessionTable>,
) {
    if hs.magic != protocol::MAGIC {
        log::debug!("handshake from {src} had bad magic, dropping");
        return;
    }
    if hs.version != protocol::VERSION {
        log::debug!("handshake from {src} had version {}, dropping", hs.version);
        return;
    }

    let Some(session) = table.get(hs.session) else {
        log::debug!("handshake from {src} for unknown session {}, dropping", hs.session);
        return;
    };

    let first_activation = session.activate_udp(src, socket.clone());
    if first_activation {
        match protocol::Handshake::new(session.session_id).encode() {
            Ok(reflected) => {
                if let Err(e) = socket.send_to(&reflected, src).await {
                    log::warn!("failed to reflect handshake to {src}: {e}");
                }
            }
            Err(e) => log::error!("failed to encode handshake reflection: {e}"),
        }
    }
}

async fn handle_time_ping(
    ping: protocol::TimePing,
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    table: Arc<SessionTable>,
    clock: Arc<Clock>,
) {
    if ping.magic != protocol::MAGIC {
        log::debug!("time ping from {src} had bad magic, dropping");
        return;
    }

    let Some(session) = table.get(ping.session) else {
        log::debug!("time ping from {src} for unknown session {}, dropping", ping.session);
        return;
    };

    if !session.is_udp_activated() {
        log::debug!("time ping from {src} before udp handshake, dropping");
        return;
    }

    let rx_millis = clock.now_millis();
    session.record_ping(&ping, rx_millis, src, socket);

    if crate::debug::show_slots() {
        log::debug!(
            "session {} wrote ack-ring slot {} for id {}",
            session.session_id,
            session.with_ack_ring(|ring| ring.next_slot()),
            ping.id,
        );
    }

    update_stats(&session, &ping, rx_millis, clock.now_unix_secs());
}

fn update_stats(session: &Session, ping: &protocol::TimePing, rx_millis: i64, now_unix_secs: i64) {
    let host = session.peer_address.to_string();

    let rx_latency_secs = session::rx_latency_millis(ping.tx_millis, rx_millis) as f64 / 1000.0;
    record_latency("rx", &host, rx_latency_secs);

    let tx_latency_secs = session::tx_latency_millis(&ping.last_acks).map(|millis| millis as f64 / 1000.0);
    if let Some(tx_latency_secs) = tx_latency_secs {
        record_latency("tx", &host, tx_latency_secs);
    }

    let loss = session.with_ack_ring(|ring| session::loss(now_unix_secs, ring, &ping.last_acks));
    if loss.exchanges == 32 {
        record_loss("rx", &host, loss.rx_loss as f64 / loss.exchanges as f64);
        record_loss("tx", &host, loss.tx_loss as f64 / loss.exchanges as f64);
    }

    if crate::debug::show_stats() {
        log::debug!(
            "session {} stats: rx_latency={rx_latency_secs:.4}s tx_latency={:?}s loss=({}/{}, {}/{})",
            session.session_id,
            tx_latency_secs,
            loss.rx_loss,
            loss.exchanges,
            loss.tx_loss,
            loss.exchanges,
        );
    }
}

#[cfg(feature = "metrics")]
fn record_latency(direction: &str, host: &str, seconds: f64) {
    crate::metrics::METRICS.record_latency_seconds(direction, host, seconds);
}

#[cfg(not(feature = "metrics"))]
fn record_latency(_direction: &str, _host: &str, _seconds: f64) {}

#[cfg(feature = "metrics")]
fn record_loss(direction: &str, host: &str, fraction: f64) {
    crate::metrics::METRICS.record_loss_fraction(direction, host, fraction);
}

#[cfg(not(feature = "metrics"))]
fn record_loss(_direction: &str, _host: &str, _fraction: f64) {}

/// Runs a session's handshake phase to completion: the inviter side
/// retransmits a handshake every second; the invitee side only waits.
/// Either way, this returns once the session is UDP-activated (spawning
/// the send loop) or once 60s pass without that happening.
pub async fn run_handshake_phase(
    session: Arc<Session>,
    socket: Arc<UdpSocket>,
    clock: Arc<Clock>,
) {
    let peer_addr = SocketAddr::new(session.peer_address, protocol::DEFAULT_PORT);
    let deadline = Instant::now() + HANDSHAKE_GIVE_UP;

    while !session.is_udp_activated() {
        if Instant::now() >= deadline {
            log::warn!(
                "session {} gave up waiting for udp handshake after 60s",
                session.session_id
            );
            return;
        }

        if session.made_by_me {
            match protocol::Handshake::new(session.session_id).encode() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer_addr).await {
                        log::warn!("failed to send handshake to {peer_addr}: {e}");
                    }
                }
                Err(e) => log::error!("failed to encode handshake: {e}"),
            }
        }

        tokio::select! {
            _ = session.udp_handshake_signal.notified() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
        }
    }

    if session.is_udp_activated() {
        log::info!("session {} established", session.session_id);
        tokio::spawn(run_send_loop(session, socket, clock));
    }
}

/// Driven by the session's `tick_signal`; on each pulse, builds and sends
/// one time ping carrying a snapshot of the local ack ring.
async fn run_send_loop(session: Arc<Session>, socket: Arc<UdpSocket>, clock: Arc<Clock>) {
    let started_at = Instant::now();

    loop {
        session.tick_signal.notified().await;

        let now = Instant::now();
        if session.rx_is_stale(now) && now.duration_since(started_at) > SEND_LOOP_GRACE {
            log::info!("session {} idle beyond 60s, send loop exiting", session.session_id);
            return;
        }

        let unix_secs = clock.now_unix_secs();
        let id = protocol::sequence_id(unix_secs);
        let tx_millis = clock.now_millis();
        let acks = session.ack_snapshot();

        let ping = protocol::TimePing::new(session.session_id, id, tx_millis, clock.offset_millis(), acks);

        let bytes = match ping.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                // Marshalling failure indicates a bug in the wire types,
                // not a transient condition, but it stays local to this
                // task rather than aborting the process: the session
                // simply stops ticking and is reaped by the next GC sweep.
                log::error!("session {} failed to encode ping: {e}", session.session_id);
                return;
            }
        };

        session.record_transmitted_id(id);

        let (reply_to, reply_socket) = session.reply_target();
        let socket_ref = reply_socket.unwrap_or_else(|| socket.clone());
        if let Err(e) = socket_ref.send_to(&bytes, reply_to).await {
            log::warn!("session {} send failed: {e}", session.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::timeout;

    async fn bind_loopback() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(socket), addr)
    }

    /// Scenario 1 from the spec: A dials B, the UDP handshake reflects
    /// exactly once, both sides reach the UDP-activated state, and the
    /// first 1 Hz tick produces a ping whose id is in `[1, 255]`.
    #[tokio::test]
    async fn handshake_happy_path_reaches_established_and_first_tick_sends_valid_id() {
        let (socket_a, addr_a) = bind_loopback().await;
        let (socket_b, addr_b) = bind_loopback().await;
        let clock = Clock::new(0);
        let mut buf = vec![0u8; 2048];

        let table_b = Arc::new(SessionTable::new());
        let session_b = table_b.insert_invitee(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let session_id = session_b.session_id;

        let table_a = Arc::new(SessionTable::new());
        let session_a = table_a.insert_inviter(session_id, IpAddr::V4(Ipv4Addr::LOCALHOST));

        // A sends the initial handshake straight to B's socket; B receives
        // and reflects it back to A's observed address.
        let hs = protocol::Handshake::new(session_id).encode().unwrap();
        socket_a.send_to(&hs, addr_b).await.unwrap();
        let (len, src) = socket_b.recv_from(&mut buf).await.unwrap();
        handle_datagram(&buf[..len], src, socket_b.clone(), table_b.clone(), clock.clone()).await;
        assert!(session_b.is_udp_activated());

        // A receives B's reflection and treats it as its own handshake
        // completing.
        let (len, from_b) = socket_a.recv_from(&mut buf).await.unwrap();
        handle_datagram(&buf[..len], from_b, socket_a.clone(), table_a.clone(), clock.clone()).await;
        assert!(session_a.is_udp_activated());

        // A retransmitting the handshake (as it does every second until it
        // sees `udp_handshake_signal`) must not trigger a second reflection.
        socket_a.send_to(&hs, addr_b).await.unwrap();
        let (len, src) = socket_b.recv_from(&mut buf).await.unwrap();
        handle_datagram(&buf[..len], src, socket_b.clone(), table_b.clone(), clock.clone()).await;
        let second_reflection = timeout(Duration::from_millis(200), socket_a.recv_from(&mut buf)).await;
        assert!(second_reflection.is_err(), "handshake must not be reflected twice");

        // Drive one send-loop tick on the now-ESTABLISHED B session and
        // check the outbound ping's id.
        session_b.tick_signal.notify_one();
        let send_task = tokio::spawn(run_send_loop(session_b.clone(), socket_b.clone(), clock.clone()));

        let (len, _) = socket_a.recv_from(&mut buf).await.unwrap();
        match protocol::decode(&buf[..len]).unwrap() {
            protocol::Packet::TimePing(ping) => {
                assert_eq!(ping.session, session_id);
                assert!((1..=255).contains(&ping.id));
            }
            protocol::Packet::Handshake(_) => panic!("expected a time ping, got a handshake"),
        }

        send_task.abort();
    }

    /// Scenario 4 from the spec: mid-session, the peer's source port
    /// changes. The next admitted datagram from the new address updates
    /// `reply_to` without any re-handshake.
    #[tokio::test]
    async fn nat_rebind_updates_reply_target_without_rehandshake() {
        let (socket_self, _) = bind_loopback().await;
        let (_old_peer_socket, old_peer_addr) = bind_loopback().await;
        let (_new_peer_socket, new_peer_addr) = bind_loopback().await;
        let clock = Clock::new(0);

        let table = Arc::new(SessionTable::new());
        let session = table.insert_invitee(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let hs = protocol::Handshake::new(session.session_id).encode().unwrap();
        handle_datagram(&hs, old_peer_addr, socket_self.clone(), table.clone(), clock.clone()).await;
        assert!(session.is_udp_activated());
        assert_eq!(session.reply_target().0, old_peer_addr);

        let ping = protocol::TimePing::new(session.session_id, 7, clock.now_millis(), 0, session.ack_snapshot())
            .encode()
            .unwrap();
        handle_datagram(&ping, new_peer_addr, socket_self.clone(), table.clone(), clock.clone()).await;

        assert_eq!(session.reply_target().0, new_peer_addr);
    }
}
