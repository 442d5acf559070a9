//! Per-entity exponential backoff with jitter, consulted by the runtime's
//! send-timer scheduling after a `PatchSender::process` error.

use rand::Rng;
use std::time::Duration;

pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, current: base }
    }

    pub fn bump(&mut self) {
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        self.current = std::cmp::min((self.current * 2) + Duration::from_millis(jitter_ms), self.cap);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..10 {
            b.bump();
        }
        assert!(b.current() <= Duration::from_secs(5));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.bump();
        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
    }
}
