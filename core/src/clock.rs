use crate::time::{self, DateTime};
use std::fmt::Debug;

/// Clock is the time collaborator of the pipeline.
///
/// Every timestamp that ends up on the wire (`x-ms-date`, SAS expiry windows)
/// goes through this trait so tests can pin signing time down to the second.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Take the current time.
    fn now(&self) -> DateTime;
}

/// Clock backed by the system time. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime {
        time::now()
    }
}

/// Clock pinned to a fixed instant, for deterministic signatures in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime);

impl Clock for FixedClock {
    fn now(&self) -> DateTime {
        self.0
    }
}
