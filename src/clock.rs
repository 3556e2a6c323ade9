//! Corrected wall time and the 1 Hz tick stream that drives every
//! session's send loop.
//!
//! The core only ever consumes a [`Clock`] (for `now()`) and a ticker
//! task that fans out pulses — nothing downstream cares whether the
//! pulse came from the system clock or a PPS device.

use std::{
    sync::{atomic::{AtomicI64, Ordering}, Arc},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use session::SessionTable;

#[cfg(feature = "pps")]
pub mod pps;

/// Produces corrected wall time: OS time plus a fixed millisecond offset
/// set once at startup by the offset estimator (or forced to zero when
/// PPS is in use, or when `clock.clock_is_perfect` skips calibration).
pub struct Clock {
    offset_millis: AtomicI64,
}

impl Clock {
    pub fn new(offset_millis: i64) -> Arc<Self> {
        Arc::new(Self {
            offset_millis: AtomicI64::new(offset_millis),
        })
    }

    /// Corrected wall time in milliseconds since the Unix epoch.
    pub fn now_millis(&self) -> i64 {
        let os_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as i64;
        os_millis + self.offset_millis.load(Ordering::Relaxed)
    }

    /// Corrected wall time in whole seconds, used to compute wire ids
    /// (`id = (unix_seconds mod 255) + 1`).
    pub fn now_unix_secs(&self) -> i64 {
        self.now_millis() / 1000
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset_millis.load(Ordering::Relaxed)
    }

    pub fn set_offset_millis(&self, offset_millis: i64) {
        self.offset_millis.store(offset_millis, Ordering::Relaxed);
    }
}

/// Sleeps until the corrected clock crosses the next second boundary,
/// then fans a pulse out to every live session's `tick_signal`.
///
/// Runs forever; the caller spawns this as its own task. A slow session
/// drops the pulse rather than blocking the ticker, since
/// `Notify::notify_one` coalesces repeated pulses into one permit.
pub async fn run_system_ticker(clock: Arc<Clock>, table: Arc<SessionTable>) {
    loop {
        let now_millis = clock.now_millis();
        let next_boundary_millis = (now_millis / 1000 + 1) * 1000;
        let wait = (next_boundary_millis - now_millis).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(wait)).await;

        for session in table.snapshot() {
            session.tick_signal.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_shifts_corrected_time() {
        let clock = Clock::new(0);
        let unshifted = clock.now_millis();

        clock.set_offset_millis(60_000);
        let shifted = clock.now_millis();

        assert!(shifted - unshifted >= 59_000);
    }
}
