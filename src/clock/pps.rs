//! Hardware pulse-per-second ticker (`pps` feature).
//!
//! Reads a Linux PPS character device (`/dev/pps0` and similar) via the
//! kernel's `timepps` ioctl interface. The constants below are the
//! `PPS_FETCH` request and the `pps_fdata` layout from
//! `linux/timepps.h`/`linux/pps.h`, defined by hand rather than pulling
//! in a full bindgen'd header crate for a handful of constants.

use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::Path,
    time::Duration,
};

use async_trait::async_trait;

use super::Clock;

const PPS_FETCH_MAGIC: u8 = b'p';
const PPS_FETCH_SEQ: u8 = 0x05;

// `_IOWR('p', 0x05, struct pps_fdata)`. `pps_fdata` is `{pps_ktime_t assert,
// clear; int timeout_sec; int timeout_nsec;}`, 40 bytes on a 64-bit host.
const PPS_FDATA_SIZE: usize = 40;
const PPS_FETCH: libc::c_ulong = ioc(3, PPS_FETCH_MAGIC, PPS_FETCH_SEQ, PPS_FDATA_SIZE);

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((ty as libc::c_ulong) << 8) | (nr as libc::c_ulong) | ((size as libc::c_ulong) << 16)
}

/// A source of 1 Hz hardware pulses. Abstracted so the ticker task never
/// has to know it's talking to a character device — the only contract
/// the core relies on is "something that yields a wall-clock time once a
/// second".
#[async_trait]
pub trait PpsSource: Send {
    /// Blocks (off the async runtime, via `spawn_blocking`) until the next
    /// rising edge, returning the wall-clock instant it was asserted at.
    async fn next_pulse(&mut self) -> std::io::Result<i64>;
}

pub struct LinuxPpsSource {
    file: File,
}

impl LinuxPpsSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    fn fetch_blocking(fd: libc::c_int) -> std::io::Result<i64> {
        // `pps_fdata`: two `pps_ktime_t` (sec: i64, nsec: i32, flags: u32 —
        // 16 bytes each) followed by a 3 s timeout (sec: i32, nsec: i32).
        let mut fdata = [0u8; PPS_FDATA_SIZE];
        // Request the kernel times out after 3s if no pulse arrives.
        fdata[32..36].copy_from_slice(&3i32.to_ne_bytes());

        let ret = unsafe { libc::ioctl(fd, PPS_FETCH as _, fdata.as_mut_ptr()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let assert_sec = i64::from_ne_bytes(fdata[0..8].try_into().unwrap());
        let assert_nsec = i32::from_ne_bytes(fdata[8..12].try_into().unwrap());
        Ok(assert_sec * 1000 + (assert_nsec as i64) / 1_000_000)
    }
}

#[async_trait]
impl PpsSource for LinuxPpsSource {
    async fn next_pulse(&mut self) -> std::io::Result<i64> {
        let fd = self.file.as_raw_fd();
        tokio::task::spawn_blocking(move || Self::fetch_blocking(fd))
            .await
            .expect("pps fetch task panicked")
    }
}

/// Runs the PPS-driven ticker: on each asserted edge, fan a pulse out to
/// every live session. The clock's offset is pinned to zero here, since a
/// hardware pulse source needs no NTP correction.
pub async fn run_pps_ticker(
    mut source: impl PpsSource,
    clock: std::sync::Arc<Clock>,
    table: std::sync::Arc<session::SessionTable>,
) {
    clock.set_offset_millis(0);

    loop {
        match tokio::time::timeout(Duration::from_secs(3), source.next_pulse()).await {
            Ok(Ok(_asserted_millis)) => {
                for session in table.snapshot() {
                    session.tick_signal.notify_one();
                }
            }
            Ok(Err(e)) => log::warn!("pps fetch failed: {e}"),
            Err(_) => log::warn!("pps fetch timed out after 3s"),
        }
    }
}
