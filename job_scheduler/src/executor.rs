use crate::error::ExecutorError;
use crate::event::{Event, EventBus, EventKind};
use crate::job::Job;
use crate::utils::map::SimpleMap;
use crate::JobId;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Accepts jobs plus one or more intended run times, enforces
/// `max_instances`, and reports completions through the scheduler's event
/// bus (spec.md §4.4).
pub trait Executor<Tz>: Send
where
    Tz: TimeZone,
{
    /// Called once when the executor is registered, or when the scheduler
    /// starts if it was registered beforehand. Hands the executor the event
    /// bus it should report completions through, rather than the whole
    /// scheduler (spec.md §9 design note).
    ///
    /// Takes `&self`, not `&mut self`: executors are held behind a shared
    /// `Arc` so the firing loop can clone a handle out, drop the registry
    /// lock, and call `submit` without holding any lock across it (spec.md
    /// §5). Implementations use interior mutability for their own state.
    fn start(&self, events: Arc<EventBus>);

    /// Synchronously enforces `max_instances` and rejects with
    /// `MaxInstancesReached` if the job already has that many runs
    /// in flight; otherwise spawns the runs and returns immediately.
    fn submit(&self, job: &Job<Tz>, run_times: Vec<DateTime<Tz>>) -> Result<(), ExecutorError>;

    /// Stop accepting new work; if `wait`, block until in-flight runs
    /// complete.
    fn shutdown(&self, wait: bool);
}

const DEFAULT_CAPACITY: usize = 4;

struct InFlight {
    handles: SimpleMap<JoinHandle<crate::job::JobResult>>,
}

/// Default executor: one tokio task per run, tracked per job id so
/// `max_instances` can be enforced without a dedicated actor thread.
///
/// Grounded on the teacher's (unwired, WIP) `runner.rs`: a
/// `SimpleMap<SimpleMap<JoinHandle<Result>>>` keyed first by job id then by
/// run slot, used the same way here to find an open slot or report
/// `MaxInstancesReached`.
pub struct ThreadPoolExecutor<Tz>
where
    Tz: TimeZone,
{
    events: Mutex<Option<Arc<EventBus>>>,
    in_flight: Mutex<std::collections::HashMap<JobId, InFlight>>,
    shut_down: std::sync::atomic::AtomicBool,
    _marker: std::marker::PhantomData<fn() -> Tz>,
}

impl<Tz> ThreadPoolExecutor<Tz>
where
    Tz: TimeZone,
{
    pub fn new() -> Self {
        Self {
            events: Mutex::new(None),
            in_flight: Mutex::new(std::collections::HashMap::new()),
            shut_down: std::sync::atomic::AtomicBool::new(false),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<Tz> Default for ThreadPoolExecutor<Tz>
where
    Tz: TimeZone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Tz> Executor<Tz> for ThreadPoolExecutor<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Send,
{
    fn start(&self, events: Arc<EventBus>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn submit(&self, job: &Job<Tz>, run_times: Vec<DateTime<Tz>>) -> Result<(), ExecutorError> {
        if self.shut_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown);
        }

        let id = job.id();
        let max_instances = job.max_instances();
        let mut in_flight = self.in_flight.lock().unwrap();
        let slot = in_flight
            .entry(id)
            .or_insert_with(|| InFlight { handles: SimpleMap::with_capacity(DEFAULT_CAPACITY) });

        reap_finished(&mut slot.handles);

        let running = (0..max_instances as usize)
            .filter(|pos| slot.handles.contains_key(*pos))
            .count();
        if running as u32 >= max_instances {
            return Err(ExecutorError::MaxInstancesReached { job: id, max_instances });
        }

        let crate::job::CallableRef::Direct(command) = job.callable().clone() else {
            return Err(ExecutorError::SubmitFailed(
                id,
                "named callable references require an embedder-supplied resolver".into(),
            ));
        };

        let events = self.events.lock().unwrap().clone();
        let handle = tokio::spawn(run_and_report(command, id, run_times, events));

        let mut pos = 0;
        while slot.handles.contains_key(pos) {
            pos += 1;
        }
        slot.handles.insert(pos, handle);
        Ok(())
    }

    fn shutdown(&self, wait: bool) {
        self.shut_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut in_flight = self.in_flight.lock().unwrap();
        if wait {
            for (_, slot) in in_flight.iter_mut() {
                for handle in drain_handles(&mut slot.handles) {
                    // Best-effort: the embedder's runtime may already be
                    // tearing down, so a failed join is logged, not fatal.
                    if let Err(err) = futures::executor::block_on(handle) {
                        log::error!(target: "job_scheduler::executor::ThreadPoolExecutor::shutdown", "failed to join run: {err:?}");
                    }
                }
            }
        } else {
            for (_, slot) in in_flight.iter_mut() {
                for handle in drain_handles(&mut slot.handles) {
                    handle.abort();
                }
            }
        }
        in_flight.clear();
    }
}

fn reap_finished(handles: &mut SimpleMap<JoinHandle<crate::job::JobResult>>) {
    let finished: Vec<usize> = (0..handles.capacity())
        .filter(|pos| handles.get(*pos).map(|h| h.is_finished()).unwrap_or(false))
        .collect();
    for pos in finished {
        handles.remove(pos);
    }
}

fn drain_handles(
    handles: &mut SimpleMap<JoinHandle<crate::job::JobResult>>,
) -> Vec<JoinHandle<crate::job::JobResult>> {
    (0..handles.capacity()).filter_map(|pos| handles.remove(pos)).collect()
}

async fn run_and_report<Tz>(
    command: Arc<dyn crate::job::AsyncJobFn>,
    id: JobId,
    run_times: Vec<DateTime<Tz>>,
    events: Option<Arc<EventBus>>,
) -> crate::job::JobResult
where
    Tz: TimeZone + Send + 'static,
    Tz::Offset: Send,
{
    let mut last = Ok(());
    for run_time in run_times {
        let result = command.call().await;
        let utc_run_time = run_time.with_timezone(&Utc);
        if let Some(bus) = &events {
            match &result {
                Ok(()) => bus.notify(
                    Event::new(EventKind::JOB_EXECUTED)
                        .with_job(id)
                        .with_run_time(utc_run_time),
                ),
                Err(err) => bus.notify(
                    Event::new(EventKind::JOB_ERROR)
                        .with_job(id)
                        .with_run_time(utc_run_time)
                        .with_error(err.to_string()),
                ),
            }
        }
        last = result;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CallableRef;
    use crate::trigger::OnceTrigger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job_with_max_instances(max_instances: u32) -> Job<Utc> {
        let trigger: Arc<dyn crate::trigger::Trigger<Utc>> = Arc::new(OnceTrigger::new(Utc::now()));
        Job::new(
            JobId(1),
            None,
            CallableRef::Direct(Arc::new(|| async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(())
            })),
            trigger,
            "default".into(),
            None,
            false,
            None,
            max_instances,
        )
    }

    #[tokio::test]
    async fn rejects_submission_beyond_max_instances() {
        let executor = ThreadPoolExecutor::new();
        executor.start(Arc::new(EventBus::new()));
        let job = job_with_max_instances(1);

        executor.submit(&job, vec![Utc::now()]).unwrap();
        let second = executor.submit(&job, vec![Utc::now()]);
        assert!(matches!(second, Err(ExecutorError::MaxInstancesReached { .. })));
    }

    #[tokio::test]
    async fn emits_job_executed_on_success() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        events.add_listener(move |event| {
            if event.kind == EventKind::JOB_EXECUTED {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }, EventKind::ALL);

        let executor = ThreadPoolExecutor::new();
        executor.start(events);
        let job = job_with_max_instances(1);
        executor.submit(&job, vec![Utc::now()]).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
