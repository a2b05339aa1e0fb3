//! Fixed-rate loop pacing

use std::time::{Duration, Instant};
use tracing::debug;

/// Something that blocks until the next control tick
pub trait Pacer: Send {
    /// Sleep until the next tick boundary
    fn sleep(&mut self);
}

/// Sleeps to an absolute deadline so the loop holds its rate regardless of
/// how long each tick took.
pub struct Rate {
    period: Duration,
    next: Instant,
}

impl Rate {
    /// Create a rate from a period
    pub fn new(period: Duration) -> Self {
        Rate {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Pacer for Rate {
    fn sleep(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            // Overran: re-anchor instead of bursting to catch up
            debug!("Tick overran by {:?}", now - self.next);
            self.next = now + self.period;
        }
    }
}

/// Pacer that never sleeps, for simulation and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct Unpaced;

impl Pacer for Unpaced {
    fn sleep(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_holds_period() {
        let mut rate = Rate::new(Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..5 {
            rate.sleep();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45));
    }

    #[test]
    fn test_rate_reanchors_after_overrun() {
        let mut rate = Rate::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(30));
        let before = Instant::now();
        rate.sleep();
        // Overrun tick returns immediately
        assert!(before.elapsed() < Duration::from_millis(5));
        let before = Instant::now();
        rate.sleep();
        assert!(before.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn test_period() {
        assert_eq!(Rate::new(Duration::from_millis(100)).period(), Duration::from_millis(100));
    }
}
