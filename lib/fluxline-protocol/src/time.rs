//! Process-wide measurement clock.
//!
//! Timestamps are Unix nanoseconds. Production use reads the system clock;
//! tests (and only tests, or process initialization) may pin the clock to a
//! fixed instant so that encoded output is deterministic.

use std::sync::atomic::{AtomicI64, Ordering::Relaxed};
use std::time::SystemTime;

// 0 means "no override installed"; any other value is the pinned timestamp.
static FIXED_UNIX_NANOS: AtomicI64 = AtomicI64::new(0);

/// Gets the current time as Unix nanoseconds.
///
/// Returns the pinned timestamp if one has been installed via
/// [`set_fixed_timestamp`], otherwise the system clock.
pub fn now_unix_nanos() -> i64 {
    match FIXED_UNIX_NANOS.load(Relaxed) {
        0 => system_unix_nanos(),
        pinned => pinned,
    }
}

/// Pins the process clock to a fixed timestamp, in Unix nanoseconds.
///
/// Intended for tests and process initialization only; the clock is not
/// meant to be re-pointed while measurements are being encoded. Passing 0
/// restores the system clock.
pub fn set_fixed_timestamp(nanos: i64) {
    FIXED_UNIX_NANOS.store(nanos, Relaxed);
}

fn system_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
