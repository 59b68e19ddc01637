//! Per-connection dual token-bucket rate limiter.
//!
//! Two independent fixed windows: a high-frequency bucket for chatty message
//! types (`ping`, `seek`, `seek_ready`, `buffer_start`, `buffer_end`) and a
//! general bucket for everything else. Mirrors the original service's
//! `middleware/rate_limiter.go` bucket semantics exactly.

use std::sync::Mutex;

const HIGH_FREQ_LIMIT: u32 = 30;
const GENERAL_LIMIT: u32 = 10;
const WINDOW_SECS: f64 = 1.0;

pub fn is_high_freq(message_type: &str) -> bool {
    matches!(
        message_type,
        "ping" | "seek" | "seek_ready" | "buffer_start" | "buffer_end"
    )
}

struct Bucket {
    count: u32,
    window_start: f64,
}

impl Bucket {
    fn new(now: f64) -> Self {
        Self { count: 0, window_start: now }
    }

    fn check(&mut self, now: f64, limit: u32) -> bool {
        if now - self.window_start > WINDOW_SECS {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= limit
    }
}

pub struct RateLimiter {
    high: Mutex<Bucket>,
    general: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(now: f64) -> Self {
        Self {
            high: Mutex::new(Bucket::new(now)),
            general: Mutex::new(Bucket::new(now)),
        }
    }

    /// Returns `true` if the message is allowed through.
    pub fn check(&self, message_type: &str, now: f64) -> bool {
        if is_high_freq(message_type) {
            self.high.lock().unwrap().check(now, HIGH_FREQ_LIMIT)
        } else {
            self.general.lock().unwrap().check(now, GENERAL_LIMIT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_freq_allows_exactly_thirty_per_window() {
        let rl = RateLimiter::new(0.0);
        for _ in 0..30 {
            assert!(rl.check("ping", 0.1));
        }
        assert!(!rl.check("ping", 0.1));
    }

    #[test]
    fn window_resets_after_one_second() {
        let rl = RateLimiter::new(0.0);
        for _ in 0..30 {
            assert!(rl.check("ping", 0.2));
        }
        assert!(!rl.check("ping", 0.3));
        // past the 1s window, bucket resets
        assert!(rl.check("ping", 1.5));
    }

    #[test]
    fn general_bucket_is_separate_and_smaller() {
        let rl = RateLimiter::new(0.0);
        for _ in 0..10 {
            assert!(rl.check("chat", 0.1));
        }
        assert!(!rl.check("chat", 0.1));
        // general exhaustion doesn't touch the high-freq bucket
        assert!(rl.check("ping", 0.1));
    }

    #[test]
    fn unknown_type_uses_general_bucket() {
        let rl = RateLimiter::new(0.0);
        for _ in 0..10 {
            assert!(rl.check("video_change", 0.1));
        }
        assert!(!rl.check("video_change", 0.1));
    }
}
