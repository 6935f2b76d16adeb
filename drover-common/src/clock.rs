//! Injectable clock
//!
//! Day-boundary and backoff arithmetic must be deterministic under test, so
//! every component that looks at the time does it through this trait.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, TimeDelta, Utc};

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current instant in UTC
    fn now(&self) -> DateTime<Utc>;

    /// The current UTC day bucket
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// The next UTC midnight after now
    fn next_midnight(&self) -> DateTime<Utc> {
        let tomorrow = self.today().succ_opt().unwrap_or(NaiveDate::MAX);
        tomorrow
            .and_hms_opt(0, 0, 0)
            .unwrap_or(chrono::NaiveDateTime::MAX)
            .and_utc()
    }
}

/// Wall-clock implementation used in production
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Create a clock frozen at an arbitrary mid-day instant
    ///
    /// # Panics
    /// Never; the embedded timestamp is valid.
    #[must_use]
    pub fn midday() -> Self {
        Self::new(
            NaiveDate::from_ymd_opt(2024, 6, 15)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .expect("valid timestamp")
                .and_utc(),
        )
    }

    /// Advance the clock by the given duration
    ///
    /// # Panics
    /// If the clock mutex is poisoned
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }

    /// Jump the clock to an absolute instant
    ///
    /// # Panics
    /// If the clock mutex is poisoned
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = to;
    }

    /// Advance past the next UTC midnight
    pub fn roll_day(&self) {
        let next = self.next_midnight();
        self.set(next + TimeDelta::seconds(1));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}
