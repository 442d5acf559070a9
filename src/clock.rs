//! Constructor-injected clock rather than a global `timeNow`. Every
//! component that needs wall-clock time takes a `Clock` so tests can
//! control it deterministically.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn now_instant(&self) -> Instant;
}

/// Real wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_instant(&self) -> Instant {
        Instant::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock whose `now_utc`/`now_instant` can be advanced explicitly, for
/// deterministic tests of backoff/reap/reset timing. Kept outside `#[cfg(test)]`
/// so both unit tests and the `tests/` integration binaries can use it.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeClock {
        utc: Mutex<DateTime<Utc>>,
        instant: Mutex<Instant>,
    }

    impl FakeClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                utc: Mutex::new(start),
                instant: Mutex::new(Instant::now()),
            })
        }

        pub fn advance(&self, d: Duration) {
            let mut utc = self.utc.lock().unwrap_or_else(|e| e.into_inner());
            *utc += chrono::Duration::from_std(d).unwrap();
            let mut instant = self.instant.lock().unwrap_or_else(|e| e.into_inner());
            *instant += d;
        }
    }

    impl Clock for FakeClock {
        fn now_utc(&self) -> DateTime<Utc> {
            *self.utc.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn now_instant(&self) -> Instant {
            *self.instant.lock().unwrap_or_else(|e| e.into_inner())
        }
    }
}
