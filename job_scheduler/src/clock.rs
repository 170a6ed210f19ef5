use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;

/// Source of "now" for a [`crate::Scheduler`]. Abstracted so tests can
/// freeze and advance time deterministically instead of racing the wall
/// clock (spec.md §8's end-to-end scenarios are phrased exactly this way:
/// "scheduler is blocked... from T0 to T0+5.5s").
pub trait Clock<Tz>: Send + Sync
where
    Tz: TimeZone,
{
    fn now(&self) -> DateTime<Tz>;
}

/// The real wall clock, converted into the scheduler's configured timezone.
pub struct SystemClock<Tz>
where
    Tz: TimeZone,
{
    timezone: Tz,
}

impl<Tz> SystemClock<Tz>
where
    Tz: TimeZone,
{
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl<Tz> Clock<Tz> for SystemClock<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }
}

/// A manually-advanced clock for tests: `process_due()` reads whatever
/// instant was last set, independent of the OS clock.
pub struct TestClock<Tz>
where
    Tz: TimeZone,
{
    current: Mutex<DateTime<Tz>>,
}

impl<Tz> TestClock<Tz>
where
    Tz: TimeZone,
{
    pub fn new(start: DateTime<Tz>) -> Self {
        Self { current: Mutex::new(start) }
    }

    pub fn set(&self, at: DateTime<Tz>) {
        *self.current.lock().unwrap() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut current = self.current.lock().unwrap();
        *current = current.clone() + by;
    }
}

impl<Tz> Clock<Tz> for TestClock<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    fn now(&self) -> DateTime<Tz> {
        self.current.lock().unwrap().clone()
    }
}
