//! Monotonically increasing microsecond-resolution clock
//!
//! `now_us()` returns a count of microseconds since the first call in this
//! process. Each call returns a value at least as large as the previous
//! call; if the underlying OS source ever regresses, the result is clamped
//! to the last value handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();
static LAST: AtomicU64 = AtomicU64::new(0);

/// The present time in microseconds, non-decreasing across calls.
pub fn now_us() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    let elapsed = anchor.elapsed().as_micros() as u64;
    // fetch_max returns the previous high-water mark.
    let prev = LAST.fetch_max(elapsed, Ordering::SeqCst);
    prev.max(elapsed)
}
