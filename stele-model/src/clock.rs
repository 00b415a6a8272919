//! Clock abstraction for testable time
//!
//! Provides a trait for getting the current time, with implementations
//! for real system time and mock time for testing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait for getting the current wall clock time in milliseconds
pub trait Clock: Send + Sync {
    /// Get the current time in milliseconds since Unix epoch
    fn now_ms(&self) -> u64;
}

/// Real system clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }
}

/// Mock clock for testing - returns a settable time
#[derive(Debug, Default)]
pub struct MockClock {
    time_ms: AtomicU64,
}

impl MockClock {
    pub fn new(time_ms: u64) -> Self {
        Self {
            time_ms: AtomicU64::new(time_ms),
        }
    }

    /// Set the current mock time.
    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    /// Advance the mock time by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.time_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_returns_reasonable_time() {
        let clock = SystemClock;
        // Should be after 2025-01-01
        assert!(clock.now_ms() > 1_735_689_600_000);
    }

    #[test]
    fn test_mock_clock_advances() {
        let clock = MockClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
    }
}
