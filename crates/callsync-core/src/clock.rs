//! Time source used to stamp call start and end times

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of "now" for timestamping transitions
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Create a clock frozen at `secs` seconds after the Unix epoch
    pub fn at_secs(secs: i64) -> Self {
        Self::new(Self::secs(secs))
    }

    /// Move the clock to `secs` seconds after the Unix epoch
    pub fn set_secs(&self, secs: i64) {
        *self.now.lock() = Self::secs(secs);
    }

    /// Advance the clock by a duration
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    fn secs(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::at_secs(100);
        assert_eq!(clock.now().timestamp(), 100);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now().timestamp(), 130);

        clock.set_secs(5);
        assert_eq!(clock.now().timestamp(), 5);
    }
}
