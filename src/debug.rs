//! Process-wide verbose-logging toggles (`debug.show_slots`,
//! `debug.show_stats`). Plain atomics set once at startup from
//! [`crate::config::Debug`] and read from the hot receive path — not
//! worth threading a `Config` reference through every call in `engine`
//! for two `bool`s that never change after startup.

use std::sync::atomic::{AtomicBool, Ordering};

static SHOW_SLOTS: AtomicBool = AtomicBool::new(false);
static SHOW_STATS: AtomicBool = AtomicBool::new(false);

/// Applies the loaded config's debug toggles. Called once, before any
/// task that might consult them is spawned.
pub fn init(show_slots: bool, show_stats: bool) {
    SHOW_SLOTS.store(show_slots, Ordering::Relaxed);
    SHOW_STATS.store(show_stats, Ordering::Relaxed);
}

pub fn show_slots() -> bool {
    SHOW_SLOTS.load(Ordering::Relaxed)
}

pub fn show_stats() -> bool {
    SHOW_STATS.load(Ordering::Relaxed)
}
