//! Clock capability
//!
//! The engine never reads wall-clock time directly; it receives a `Clock`
//! so tests can inject a deterministic source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Time source. `now_ms` is a Unix timestamp in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }
}

/// Manually advanced clock for tests.
///
/// Every read advances by one millisecond so consecutive orders get
/// strictly increasing created-at stamps (price-time priority depends
/// on distinct timestamps only for readability; the book itself is FIFO).
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_monotonic() {
        let clock = ManualClock::new(1_000);
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b > a);

        clock.advance(500);
        assert!(clock.now_ms() >= 1_500);
    }
}
