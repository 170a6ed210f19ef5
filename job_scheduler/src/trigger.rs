use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use std::fmt;

/// Pure function of its configuration and argument: "given an instant, what
/// is the next firing instant?"
///
/// The scheduler core only ever calls `next_fire_time`; it never inspects a
/// trigger's internal representation. Concrete triggers (cron expression,
/// fixed interval, one-shot date) live in this module as the one
/// implementation this spec ships, but any type implementing this trait may
/// be plugged into [`crate::job::Job`].
pub trait Trigger<Tz>: Send + Sync
where
    Tz: TimeZone,
{
    /// Returns the earliest fire time strictly after `after`, or `None` if
    /// the trigger has no more fire times (the job should then be retired).
    fn next_fire_time(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>>;
}

impl<Tz> fmt::Debug for dyn Trigger<Tz> + '_
where
    Tz: TimeZone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Trigger")
    }
}

/// Cron-syntax trigger, grounded on the teacher's `job::job_internal::Job`
/// use of `cron::Schedule`. Unlike the teacher's `upcoming_owned` iterator
/// (which is stateful and consumed as the schedule advances), this adapter
/// calls `Schedule::after` fresh on every invocation so `next_fire_time`
/// stays a pure function of `after`, as spec.md's glossary requires.
pub struct CronTrigger<Tz>
where
    Tz: TimeZone,
{
    schedule: Schedule,
    timezone: Tz,
}

impl<Tz> CronTrigger<Tz>
where
    Tz: TimeZone,
{
    pub fn new(schedule: Schedule, timezone: Tz) -> Self {
        Self { schedule, timezone }
    }
}

impl<Tz> Trigger<Tz> for CronTrigger<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    fn next_fire_time(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule
            .after(&after.with_timezone(&Utc))
            .next()
            .map(|utc| utc.with_timezone(&self.timezone))
    }
}

/// Fixed-period trigger: fires every `period` starting at `start`.
pub struct IntervalTrigger<Tz>
where
    Tz: TimeZone,
{
    start: DateTime<Tz>,
    period: chrono::Duration,
}

impl<Tz> IntervalTrigger<Tz>
where
    Tz: TimeZone,
{
    pub fn new(start: DateTime<Tz>, period: chrono::Duration) -> Self {
        assert!(period > chrono::Duration::zero(), "interval period must be positive");
        Self { start, period }
    }
}

impl<Tz> Trigger<Tz> for IntervalTrigger<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    fn next_fire_time(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        if after < self.start {
            return Some(self.start.clone());
        }
        let elapsed = after.clone() - self.start.clone();
        let periods_elapsed = elapsed.num_milliseconds() / self.period.num_milliseconds();
        let mut next = self.start.clone() + self.period * (periods_elapsed as i32 + 1);
        while next <= after {
            next = next + self.period;
        }
        Some(next)
    }
}

/// One-shot trigger: fires exactly once at `run_date`.
///
/// This is what `add_job(trigger = None)` synthesizes (spec.md §4.1): an
/// immediate fire "now", with `misfire_grace_time` forced to `None` by the
/// caller so the fire cannot be dropped as a misfire.
///
/// Unlike `CronTrigger`, this one is intentionally stateful: `next_fire_time`
/// can only ever produce `run_date` once, on its first call (made by
/// `Job::compute_initial_run_time` right after insertion), regardless of
/// `after`. Every later call -- including the lookahead inside
/// `pending_run_times` and the post-fire call that decides whether to
/// retire the job -- returns `None`. This mirrors how a one-shot date
/// trigger's "next fire time" is really just "have I fired yet?", not a
/// pure function of an instant.
pub struct OnceTrigger<Tz>
where
    Tz: TimeZone,
{
    run_date: DateTime<Tz>,
    fired: std::sync::atomic::AtomicBool,
}

impl<Tz> OnceTrigger<Tz>
where
    Tz: TimeZone,
{
    pub fn new(run_date: DateTime<Tz>) -> Self {
        Self {
            run_date,
            fired: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn at_naive(run_date: NaiveDateTime, tz: Tz) -> Self
    where
        Tz: Clone,
    {
        Self::new(tz.from_utc_datetime(&run_date))
    }
}

impl<Tz> Trigger<Tz> for OnceTrigger<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    fn next_fire_time(&self, _after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        use std::sync::atomic::Ordering;
        if self.fired.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.run_date.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn once_trigger_fires_exactly_once() {
        let now = Utc::now();
        let trigger = OnceTrigger::new(now);

        // The first call always yields `run_date`, regardless of `after`.
        assert_eq!(trigger.next_fire_time(now + chrono::Duration::seconds(1)), Some(now));
        // Every call after that is `None`, permanently.
        assert_eq!(trigger.next_fire_time(now - chrono::Duration::seconds(1)), None);
        assert_eq!(trigger.next_fire_time(now), None);
    }

    #[test]
    fn interval_trigger_advances_by_whole_periods() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let trigger = IntervalTrigger::new(start, chrono::Duration::seconds(1));

        let after = start + chrono::Duration::milliseconds(5500);
        let next = trigger.next_fire_time(after).unwrap();
        assert_eq!(next, start + chrono::Duration::seconds(6));
    }

    #[test]
    fn cron_trigger_is_a_pure_function_of_after() {
        let schedule: Schedule = "0 * * * * *".parse().unwrap();
        let trigger = CronTrigger::new(schedule, Utc);
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 30).unwrap();

        let first = trigger.next_fire_time(t0);
        let second = trigger.next_fire_time(t0);
        assert_eq!(first, second);
        assert_eq!(first, Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap()));
    }
}
