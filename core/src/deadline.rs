//! Busy-interval deadline tracking
//!
//! The device spends a fixed amount of wall-clock time busy after each
//! read, program, or erase. A single deadline timestamp models that
//! interval: while the clock is before the deadline the device reports
//! busy, and commands other than a setup restart are protocol violations.

use crate::clock;

/// Time the device stays busy after a page read, in microseconds.
pub const READ_PAGE_DURATION_US: u64 = 100;
/// Time the device stays busy after a page program.
pub const PROGRAM_PAGE_DURATION_US: u64 = 600;
/// Time the device stays busy after a block erase.
pub const ERASE_BLOCK_DURATION_US: u64 = 2000;
/// Time the device is unavailable after a reset pulse.
pub const RESET_DURATION_US: u64 = 500;

/// Single-slot "busy until T" timer. A deadline of zero means ready.
#[derive(Debug, Default)]
pub struct Deadline {
    until_us: u64,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline `duration_us` into the future.
    pub fn set(&mut self, duration_us: u64) {
        self.until_us = clock::now_us() + duration_us;
    }

    pub fn clear(&mut self) {
        self.until_us = 0;
    }

    /// True while the current time is earlier than the armed deadline.
    pub fn busy(&self) -> bool {
        clock::now_us() < self.until_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_deadline_is_ready() {
        assert!(!Deadline::new().busy());
    }

    #[test]
    fn test_armed_deadline_reports_busy_then_expires() {
        let mut deadline = Deadline::new();
        deadline.set(5_000);
        assert!(deadline.busy());
        thread::sleep(Duration::from_micros(6_000));
        assert!(!deadline.busy());
    }

    #[test]
    fn test_clear_makes_ready_immediately() {
        let mut deadline = Deadline::new();
        deadline.set(1_000_000);
        assert!(deadline.busy());
        deadline.clear();
        assert!(!deadline.busy());
    }
}
