//! TCP invite exchange: the listener (invitee side) and dialer (inviter
//! side).

use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::Context;
use protocol::invite::{Banner, INVITE_REQUEST, MAX_BANNER_READ, REJECTION};
use session::{Session, SessionTable};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

use crate::{clock::Clock, engine};

/// Accepts inbound TCP invites forever, spawning a short-lived task per
/// connection. Each connection that successfully allocates a session
/// also spawns that session's handshake-wait phase once the TCP leg has
/// closed.
pub async fn run_invite_listener(
    listen: std::net::SocketAddr,
    project_url: Arc<str>,
    table: Arc<SessionTable>,
    udp_socket: Arc<UdpSocket>,
    clock: Arc<Clock>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind TCP invite listener on {listen}"))?;

    log::info!("tcp invite listener bound: {listen}");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("tcp accept error: {e}");
                continue;
            }
        };

        let table = table.clone();
        let project_url = project_url.clone();
        let udp_socket = udp_socket.clone();
        let clock = clock.clone();

        tokio::spawn(async move {
            match handle_invite(stream, peer_addr.ip(), &project_url, &table).await {
                Ok(Some(session)) => {
                    tokio::spawn(engine::run_handshake_phase(session, udp_socket, clock));
                }
                Ok(None) => {}
                Err(e) => log::debug!("invite from {peer_addr} failed: {e}"),
            }
        });
    }
}

/// Handles one inbound connection to its conclusion: banner out, request
/// in, response out, close. Every exit path closes the socket (it goes
/// out of scope) rather than keeping it open — the TCP leg is only used
/// to allocate a session id.
async fn handle_invite(
    mut stream: TcpStream,
    peer_ip: IpAddr,
    project_url: &str,
    table: &SessionTable,
) -> anyhow::Result<Option<Arc<Session>>> {
    let banner = Banner::new(project_url);
    stream.write_all(banner.as_bytes()).await?;

    let mut buf = vec![0u8; MAX_BANNER_READ + 1];
    let n = stream.read(&mut buf).await?;

    if n > MAX_BANNER_READ {
        // Anti-amplification: an inviter that sends more than the cutoff
        // before we've parsed a request gets disconnected, no response.
        log::debug!("invite from {peer_ip} exceeded {MAX_BANNER_READ} bytes, dropping");
        return Ok(None);
    }

    if &buf[..n] != INVITE_REQUEST {
        stream.write_all(REJECTION).await?;
        return Ok(None);
    }

    let session = table.insert_invitee(peer_ip);
    let response = session.session_id.to_string();
    stream.write_all(response.as_bytes()).await?;

    log::info!("invite accepted from {peer_ip}: session={}", session.session_id);
    Ok(Some(session))
}

/// Dials a peer's TCP invite listener, retrying every second on failure,
/// until a session is allocated.
pub async fn dial_peer(peer_ip: IpAddr, project_url: Arc<str>, table: Arc<SessionTable>) -> Arc<Session> {
    loop {
        match try_dial_once(peer_ip, &project_url).await {
            Ok(session_id) => {
                log::info!("dial to {peer_ip} succeeded: session={session_id}");
                return table.insert_inviter(session_id, peer_ip);
            }
            Err(e) => {
                log::debug!("dial to {peer_ip} failed: {e}, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn try_dial_once(peer_ip: IpAddr, project_url: &str) -> anyhow::Result<u32> {
    let addr = (peer_ip, protocol::DEFAULT_PORT);
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to {peer_ip}:{}", protocol::DEFAULT_PORT))?;

    let mut banner_buf = vec![0u8; MAX_BANNER_READ];
    let n = stream.read(&mut banner_buf).await?;
    let banner = std::str::from_utf8(&banner_buf[..n]).context("banner was not valid UTF-8")?;
    anyhow::ensure!(Banner::validate(banner.trim_end()), "unexpected banner: {banner:?}");
    let _ = project_url; // the dialer validates only the protocol prefix, not the url suffix.

    stream.write_all(INVITE_REQUEST).await?;

    let mut response = [0u8; 10];
    let n = stream.read(&mut response).await?;
    protocol::invite::parse_session_id(&response[..n])
        .with_context(|| format!("could not parse session id from {:?}", &response[..n]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn invite_happy_path_allocates_a_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let table = Arc::new(SessionTable::new());
        let table_for_server = table.clone();

        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            handle_invite(stream, addr.ip(), "https://example.invalid", &table_for_server)
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(listen_addr).await.unwrap();
        let mut banner_buf = vec![0u8; 256];
        let n = stream.read(&mut banner_buf).await.unwrap();
        assert!(protocol::invite::Banner::validate(
            std::str::from_utf8(&banner_buf[..n]).unwrap().trim_end()
        ));

        stream.write_all(INVITE_REQUEST).await.unwrap();
        let mut response = [0u8; 16];
        let n = stream.read(&mut response).await.unwrap();
        let session_id: u32 = std::str::from_utf8(&response[..n]).unwrap().parse().unwrap();

        assert!(table.get(session_id).is_some());
    }

    #[tokio::test]
    async fn garbage_request_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let table = Arc::new(SessionTable::new());
        let table_for_server = table.clone();

        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            handle_invite(stream, addr.ip(), "https://example.invalid", &table_for_server)
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(listen_addr).await.unwrap();
        let mut banner_buf = vec![0u8; 256];
        stream.read(&mut banner_buf).await.unwrap();

        stream.write_all(b"WHAT\r\n").await.unwrap();
        let mut response = vec![0u8; 64];
        let n = stream.read(&mut response).await.unwrap();
        assert_eq!(&response[..n], REJECTION);
        assert_eq!(table.len(), 0);
    }
}
