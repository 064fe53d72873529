//! A trait-object clock so deadline/timeout logic (spec §4.4, §5) is
//! testable without sleeping in real time.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that can be advanced manually, for deterministic timeout/deadline
/// tests in `engine-pool` and `engine-scheduler`.
#[derive(Clone)]
pub struct FakeClock {
    millis_since_epoch: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.millis_since_epoch
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis_since_epoch.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).expect("fake clock millis always in range")
    }
}
