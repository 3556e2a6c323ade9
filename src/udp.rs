//! The single multiplexed UDP socket and its inbound admission control.

use std::{
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::{clock::Clock, engine};

/// Token-bucket rate limiter guarding the UDP receive path: `rate =
/// udp.pps`, `burst = 3 * rate`. A plain atomic-refill bucket, in the
/// style of the lock-protected counters used elsewhere in this crate
/// family (`parking_lot::Mutex` guarding a small struct, refilled lazily
/// on each check rather than by a background timer task).
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32) -> Self {
        let rate_per_sec = rate_per_sec as f64;
        let capacity = rate_per_sec * 3.0;
        Self {
            rate_per_sec,
            capacity,
            inner: Mutex::new(Inner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to admit one datagram; `false` means the caller must drop
    /// it before parsing.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        inner.last_refill = now;

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Binds the single process-wide UDP socket.
pub async fn bind(listen: std::net::SocketAddr) -> anyhow::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(listen).await?;
    log::info!("udp transport bound: {listen}");
    Ok(Arc::new(socket))
}

/// Reads datagrams forever, admitting each through `limiter` before
/// spawning a short-lived task to parse and dispatch it to the session
/// engine.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    table: Arc<session::SessionTable>,
    clock: Arc<Clock>,
    limiter: Arc<TokenBucket>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(recv) => recv,
            Err(e) => {
                log::warn!("udp recv error: {e}");
                continue;
            }
        };

        if !limiter.try_admit() {
            continue;
        }

        let datagram = buf[..len].to_vec();
        let socket = socket.clone();
        let table = table.clone();
        let clock = clock.clone();

        tokio::spawn(async move {
            engine::handle_datagram(&datagram, src, socket, table, clock).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn burst_admits_up_to_three_times_rate_then_drops() {
        let bucket = TokenBucket::new(10);
        for _ in 0..30 {
            assert!(bucket.try_admit());
        }
        assert!(!bucket.try_admit());
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(100);
        for _ in 0..300 {
            assert!(bucket.try_admit());
        }
        assert!(!bucket.try_admit());

        sleep(Duration::from_millis(50));
        assert!(bucket.try_admit());
    }
}
