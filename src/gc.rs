//! The garbage-collection sweep: once a minute, reap sessions whose
//! handshake never completed or that have gone idle.

use std::{sync::Arc, time::Instant};

use session::SessionTable;
use tokio::time::{interval, Duration};

const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Runs forever, sweeping the session table once per interval, as its own
/// task.
pub async fn run(table: Arc<SessionTable>) {
    let mut ticker = interval(GC_INTERVAL);

    loop {
        ticker.tick().await;
        let reaped = table.gc_sweep(Instant::now());
        if reaped > 0 {
            log::info!("gc: reaped {reaped} session(s), {} remaining", table.len());
        }
    }
}
