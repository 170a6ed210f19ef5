//! End-to-end scenarios exercised against a frozen `TestClock`, mirroring
//! the "scheduler is blocked... then resumes" framing used throughout the
//! scheduler's test plan. Each scenario advances the clock instantly and
//! nudges the firing loop with `request_wakeup`, rather than sleeping in
//! real time for the intervals under test.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use job_scheduler::{
    Event, EventKind, IntervalTrigger, JobBuilder, Scheduler, SchedulerConfig, TestClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

struct Recorder {
    kinds: Mutex<Vec<EventKind>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { kinds: Mutex::new(Vec::new()) })
    }

    fn attach(self: &Arc<Self>, scheduler: &Arc<Scheduler<Utc>>) {
        let me = self.clone();
        scheduler.add_listener(move |event: &Event| me.kinds.lock().unwrap().push(event.kind), EventKind::ALL);
    }

    fn count(&self, kind: EventKind) -> usize {
        self.kinds.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[tokio::test]
async fn one_shot_immediate_fires_once_then_is_removed() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock, SchedulerConfig::default());
    let recorder = Recorder::new();
    recorder.attach(&scheduler);

    scheduler.start().await.unwrap();
    let handle = scheduler.add_job(JobBuilder::new(|| async { Ok(()) })).unwrap();
    settle().await;

    assert_eq!(recorder.count(EventKind::JOB_ADDED), 1);
    assert_eq!(recorder.count(EventKind::JOB_EXECUTED), 1);
    assert!(scheduler.job_state(&handle).is_none());

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn interval_with_coalesce_submits_once_for_the_whole_gap() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock.clone(), SchedulerConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    scheduler.add_listener(
        move |event: &Event| {
            if event.kind == EventKind::JOB_EXECUTED {
                runs2.fetch_add(1, Ordering::SeqCst);
            }
        },
        EventKind::ALL,
    );

    scheduler.start().await.unwrap();
    let trigger = Arc::new(IntervalTrigger::new(t0(), ChronoDuration::seconds(1)));
    let handle = scheduler
        .add_job(
            JobBuilder::new(|| async { Ok(()) })
                .trigger(trigger)
                .coalesce(true),
        )
        .unwrap();
    settle().await;

    // Freeze at T0+5.5s in one jump, as if the embedding loop had been
    // blocked the whole time, then nudge the loop awake.
    clock.set(t0() + ChronoDuration::milliseconds(5500));
    scheduler.request_wakeup();
    settle().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let job = scheduler.job_state(&handle).expect("job still scheduled");
    assert_eq!(job.next_run_time().cloned(), Some(t0() + ChronoDuration::seconds(6)));

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn misfire_grace_time_drops_late_fires_but_keeps_the_last_on_time_one() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock.clone(), SchedulerConfig::default());
    let recorder = Recorder::new();
    recorder.attach(&scheduler);

    scheduler.start().await.unwrap();
    let trigger = Arc::new(IntervalTrigger::new(t0(), ChronoDuration::seconds(1)));
    scheduler
        .add_job(
            JobBuilder::new(|| async { Ok(()) })
                .trigger(trigger)
                .misfire_grace_time(Some(2))
                .coalesce(true),
        )
        .unwrap();
    settle().await;

    clock.set(t0() + ChronoDuration::seconds(10));
    scheduler.request_wakeup();
    settle().await;

    assert_eq!(recorder.count(EventKind::JOB_EXECUTED), 1, "only the T0+10s fire should land");
    assert_eq!(
        recorder.count(EventKind::JOB_MISSED),
        7,
        "each candidate dropped by the misfire grace time should report JOB_MISSED"
    );

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn max_instances_rejects_overlapping_submissions_without_advancing_state() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock.clone(), SchedulerConfig::default());

    scheduler.start().await.unwrap();
    let trigger = Arc::new(IntervalTrigger::new(t0(), ChronoDuration::seconds(1)));
    let handle = scheduler
        .add_job(
            JobBuilder::new(|| async {
                tokio::time::sleep(StdDuration::from_millis(300)).await;
                Ok(())
            })
            .trigger(trigger)
            .max_instances(1),
        )
        .unwrap();
    settle().await; // first run (T0) is now in flight

    clock.set(t0() + ChronoDuration::seconds(1));
    scheduler.request_wakeup();
    settle().await;

    let job = scheduler.job_state(&handle).expect("job still scheduled");
    assert_eq!(job.runs(), 1, "the rejected submission at T0+1s must not bump runs");

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn modify_job_with_an_empty_change_set_emits_no_event() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock, SchedulerConfig::default());

    scheduler.start().await.unwrap();
    let trigger = Arc::new(IntervalTrigger::new(t0(), ChronoDuration::seconds(60)));
    let handle = scheduler
        .add_job(JobBuilder::new(|| async { Ok(()) }).trigger(trigger))
        .unwrap();
    settle().await; // job is persisted in its store, not merely pending

    let recorder = Recorder::new();
    recorder.attach(&scheduler);

    scheduler.modify_job(handle.id, &handle.store_alias, Vec::new()).unwrap();
    settle().await;

    assert_eq!(
        recorder.count(EventKind::JOB_MODIFIED),
        0,
        "an empty change set must be a no-op that emits no JOB_MODIFIED"
    );

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn jobs_added_before_start_are_pending_then_flushed_in_order() {
    init_logging();
    let scheduler = Scheduler::new();
    let first = scheduler.add_job(JobBuilder::new(|| async { Ok(()) })).unwrap();
    let second = scheduler.add_job(JobBuilder::new(|| async { Ok(()) })).unwrap();

    let pending = scheduler.get_jobs(None, Some(true));
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[1].id, second.id);

    scheduler.start().await.unwrap();
    assert!(scheduler.get_jobs(None, Some(true)).is_empty());

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn a_panicking_listener_does_not_blind_the_others() {
    init_logging();
    let clock = Arc::new(TestClock::new(t0()));
    let scheduler = Scheduler::with_clock(clock, SchedulerConfig::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();

    scheduler.add_listener(|_: &Event| panic!("listener blew up"), EventKind::ALL);
    scheduler.add_listener(
        move |_: &Event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        },
        EventKind::ALL,
    );

    scheduler.start().await.unwrap();
    scheduler.add_job(JobBuilder::new(|| async { Ok(()) })).unwrap();
    settle().await;

    assert!(seen.load(Ordering::SeqCst) > 0);
    scheduler.shutdown(false).await.unwrap();
}
