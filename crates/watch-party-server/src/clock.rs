//! Monotonic time source.
//!
//! Every timestamp in the room state machine is a `f64` of wall seconds from
//! this source. Hiding it behind a trait lets the drift controller, barrier
//! timeouts, and sweeper be tested by advancing a fake clock instead of
//! sleeping in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A clock that starts at a fixed instant and only advances when told to.
#[derive(Debug)]
pub struct TestClock {
    bits: AtomicU64,
}

impl TestClock {
    pub fn new(start: f64) -> Self {
        Self { bits: AtomicU64::new(start.to_bits()) }
    }

    pub fn advance(&self, secs: f64) {
        let cur = f64::from_bits(self.bits.load(Ordering::Relaxed));
        self.bits.store((cur + secs).to_bits(), Ordering::Relaxed);
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
