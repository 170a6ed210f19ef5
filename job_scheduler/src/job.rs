use crate::error::SchedulerError;
use crate::trigger::Trigger;
use crate::JobId;
use chrono::{DateTime, TimeZone};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub type JobResult = core::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Adapted from Ibraheem Ahmed's solution on https://stackoverflow.com, Feb 5, 2021.
/// An implementation to store async functions as trait objects in structs.
pub trait AsyncJobFn: Send + Sync {
    fn call(&self) -> BoxFuture<'static, JobResult>;
}

impl<T, F> AsyncJobFn for T
where
    T: (Fn() -> F) + Send + Sync,
    F: std::future::Future<Output = JobResult> + Send + 'static,
{
    fn call(&self) -> BoxFuture<'static, JobResult> {
        Box::pin(self())
    }
}

/// What a job calls at fire time.
///
/// Spec.md §9 collapses textual `module_path:object_path` references to "an
/// opaque callable token the executor knows how to invoke"; `Direct` is that
/// token today, and `Named` is the reserved seam for an embedder-supplied
/// resolver, left unimplemented since resolution is an external concern.
#[derive(Clone)]
pub enum CallableRef {
    Direct(Arc<dyn AsyncJobFn>),
    Named(String),
}

impl fmt::Debug for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallableRef::Direct(_) => f.write_str("CallableRef::Direct(..)"),
            CallableRef::Named(name) => write!(f, "CallableRef::Named({name:?})"),
        }
    }
}

/// A scheduled unit of work: identity, trigger, run-time policies, and
/// mutable scheduling state. See spec.md §3 for the full invariant list.
///
/// Cloning is cheap (the callable and trigger are `Arc`-shared); the firing
/// loop clones a job out of its store before submitting it to an executor,
/// so no store lock is held across `Executor::submit`.
#[derive(Clone)]
pub struct Job<Tz>
where
    Tz: TimeZone,
{
    id: JobId,
    name: Option<String>,
    callable: CallableRef,
    trigger: Arc<dyn Trigger<Tz>>,
    executor_alias: String,
    misfire_grace_time: Option<i64>,
    coalesce: bool,
    max_runs: Option<u32>,
    max_instances: u32,
    next_run_time: Option<DateTime<Tz>>,
    runs: u32,
}

impl<Tz> Job<Tz>
where
    Tz: TimeZone,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        name: Option<String>,
        callable: CallableRef,
        trigger: Arc<dyn Trigger<Tz>>,
        executor_alias: String,
        misfire_grace_time: Option<i64>,
        coalesce: bool,
        max_runs: Option<u32>,
        max_instances: u32,
    ) -> Self {
        Self {
            id,
            name,
            callable,
            trigger,
            executor_alias,
            misfire_grace_time,
            coalesce,
            max_runs,
            max_instances,
            next_run_time: None,
            runs: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn callable(&self) -> &CallableRef {
        &self.callable
    }

    pub fn executor_alias(&self) -> &str {
        &self.executor_alias
    }

    pub fn coalesce(&self) -> bool {
        self.coalesce
    }

    pub fn max_runs(&self) -> Option<u32> {
        self.max_runs
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn next_run_time(&self) -> Option<&DateTime<Tz>> {
        self.next_run_time.as_ref()
    }

    pub fn set_next_run_time(&mut self, next: Option<DateTime<Tz>>) {
        self.next_run_time = next;
    }

    pub fn set_runs(&mut self, runs: u32) {
        self.runs = runs;
    }

    /// A job with `next_run_time = None` is retired: it must not be
    /// returned by `due_scan` (spec.md §3 invariant).
    pub fn is_retired(&self) -> bool {
        self.next_run_time.is_none()
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger<Tz>> {
        &self.trigger
    }

    /// Computes the job's initial `next_run_time` by evaluating its trigger
    /// against `now`. Called once, when the job is flushed from the pending
    /// list or added directly to a running scheduler (spec.md §4.1 step 4 /
    /// `real_add_job`).
    pub fn compute_initial_run_time(&mut self, now: DateTime<Tz>) {
        self.next_run_time = self.trigger.next_fire_time(now);
    }

    /// Every trigger fire time in `[next_run_time, now]` still within
    /// `misfire_grace_time` of `now`, plus the fire times dropped for falling
    /// outside that grace window. If `coalesce` is set and more than one
    /// surviving candidate remains, only the latest is kept (spec.md §4.1
    /// step 3b) -- coalesced-away candidates are not misfires and are not
    /// counted in `missed`.
    ///
    /// This walks the trigger forward from `next_run_time` rather than
    /// storing past fire times, since the trigger is the only source of
    /// truth for "what times did this job mean to fire at".
    pub fn pending_run_times(&self, now: DateTime<Tz>) -> (Vec<DateTime<Tz>>, Vec<DateTime<Tz>>)
    where
        Tz: Clone,
    {
        let Some(mut candidate) = self.next_run_time.clone() else {
            return (Vec::new(), Vec::new());
        };

        let mut run_times = Vec::new();
        let mut missed = Vec::new();
        while candidate <= now {
            let is_missed = match self.misfire_grace_time {
                None => false,
                Some(grace) => (now.clone() - candidate.clone()).num_seconds() > grace,
            };
            if is_missed {
                missed.push(candidate.clone());
            } else {
                run_times.push(candidate.clone());
            }
            match self.trigger.next_fire_time(candidate.clone()) {
                Some(next) if next <= now => candidate = next,
                _ => break,
            }
        }

        if self.coalesce && run_times.len() > 1 {
            let last = run_times.pop().unwrap();
            run_times.clear();
            run_times.push(last);
        }

        (run_times, missed)
    }

    /// Applies a validated set of field changes, rejecting unknown or
    /// inconsistent keys. Grounded on `Job.validate_changes`/`Job.modify` in
    /// `apscheduler.job.Job`; the id-rename ambiguity flagged in spec.md §9
    /// is resolved here as "rename last, after other fields are applied".
    pub fn apply_change(&mut self, change: JobChange<Tz>) -> Result<(), SchedulerError> {
        match change {
            JobChange::Name(name) => self.name = name,
            JobChange::Trigger(trigger) => self.trigger = trigger,
            JobChange::MisfireGraceTime(grace) => {
                if let Some(g) = grace {
                    if g < 0 {
                        return Err(SchedulerError::InvalidChange {
                            job: self.id,
                            reason: "misfire_grace_time must be >= 0".into(),
                        });
                    }
                }
                self.misfire_grace_time = grace;
            }
            JobChange::Coalesce(coalesce) => self.coalesce = coalesce,
            JobChange::MaxRuns(max_runs) => self.max_runs = max_runs,
            JobChange::MaxInstances(max_instances) => {
                if max_instances < 1 {
                    return Err(SchedulerError::InvalidChange {
                        job: self.id,
                        reason: "max_instances must be >= 1".into(),
                    });
                }
                self.max_instances = max_instances;
            }
            JobChange::ExecutorAlias(alias) => self.executor_alias = alias,
        }
        Ok(())
    }
}

impl<Tz> fmt::Debug for Job<Tz>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("next_run_time", &self.next_run_time)
            .field("runs", &self.runs)
            .field("max_runs", &self.max_runs)
            .finish()
    }
}

/// One field change accepted by `Scheduler::modify_job`. Unknown keys have
/// no representation here at all, which is how this port rejects them: the
/// compiler does it instead of a runtime `KeyError`.
pub enum JobChange<Tz>
where
    Tz: TimeZone,
{
    Name(Option<String>),
    Trigger(Arc<dyn Trigger<Tz>>),
    MisfireGraceTime(Option<i64>),
    Coalesce(bool),
    MaxRuns(Option<u32>),
    MaxInstances(u32),
    ExecutorAlias(String),
}

/// Builder for a new [`Job`], mirroring `add_job`'s keyword arguments
/// (spec.md §6) in the same field order as `add_job` itself -- per spec.md
/// §9's resolution of the `scheduled_job` parameter-order bug.
pub struct JobBuilder<Tz>
where
    Tz: TimeZone,
{
    callable: CallableRef,
    trigger: Option<Arc<dyn Trigger<Tz>>>,
    id: Option<JobId>,
    name: Option<String>,
    misfire_grace_time: Option<Option<i64>>,
    coalesce: Option<bool>,
    max_runs: Option<u32>,
    max_instances: u32,
    jobstore: String,
    executor: String,
}

impl<Tz> JobBuilder<Tz>
where
    Tz: TimeZone,
{
    pub fn new<F>(func: F) -> Self
    where
        F: AsyncJobFn + 'static,
    {
        Self {
            callable: CallableRef::Direct(Arc::new(func)),
            trigger: None,
            id: None,
            name: None,
            misfire_grace_time: None,
            coalesce: None,
            max_runs: None,
            max_instances: 1,
            jobstore: "default".to_string(),
            executor: "default".to_string(),
        }
    }

    pub fn trigger(mut self, trigger: Arc<dyn Trigger<Tz>>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn misfire_grace_time(mut self, grace: Option<i64>) -> Self {
        self.misfire_grace_time = Some(grace);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn jobstore(mut self, alias: impl Into<String>) -> Self {
        self.jobstore = alias.into();
        self
    }

    pub fn executor(mut self, alias: impl Into<String>) -> Self {
        self.executor = alias.into();
        self
    }

    pub(crate) fn id_requested(&self) -> Option<JobId> {
        self.id
    }

    pub(crate) fn jobstore_alias(&self) -> &str {
        &self.jobstore
    }

    /// Finalizes the builder into a `Job`, synthesizing an immediate
    /// one-shot trigger when none was supplied and forcing
    /// `misfire_grace_time = None` for it, exactly per spec.md §4.1.
    pub(crate) fn build(
        self,
        id: JobId,
        now: DateTime<Tz>,
        default_misfire_grace_time: i64,
        default_coalesce: bool,
    ) -> Job<Tz>
    where
        Tz: Send + Sync + 'static,
        Tz::Offset: Send + Sync,
    {
        let (trigger, misfire_grace_time) = match self.trigger {
            Some(trigger) => (
                trigger,
                self.misfire_grace_time
                    .unwrap_or(Some(default_misfire_grace_time)),
            ),
            None => {
                let once: Arc<dyn Trigger<Tz>> = Arc::new(crate::trigger::OnceTrigger::new(now));
                (once, None)
            }
        };

        Job::new(
            id,
            self.name,
            self.callable,
            trigger,
            self.executor,
            misfire_grace_time,
            self.coalesce.unwrap_or(default_coalesce),
            self.max_runs,
            self.max_instances,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn noop_job<Tz: TimeZone + Send + Sync + 'static>(
        id: JobId,
        trigger: Arc<dyn Trigger<Tz>>,
    ) -> Job<Tz>
    where
        Tz::Offset: Send + Sync,
    {
        Job::new(
            id,
            None,
            CallableRef::Direct(Arc::new(|| async { Ok(()) })),
            trigger,
            "default".into(),
            None,
            false,
            None,
            1,
        )
    }

    #[test]
    fn retired_job_has_no_next_run_time() {
        let trigger: Arc<dyn Trigger<Utc>> = Arc::new(crate::trigger::OnceTrigger::new(Utc::now()));
        let mut job = noop_job(JobId(1), trigger);
        assert!(job.is_retired());
        job.set_next_run_time(Some(Utc::now()));
        assert!(!job.is_retired());
    }

    #[test]
    fn coalesce_collapses_multiple_due_times_to_the_latest() {
        let start = Utc::now() - chrono::Duration::seconds(10);
        let trigger: Arc<dyn Trigger<Utc>> =
            Arc::new(crate::trigger::IntervalTrigger::new(start, chrono::Duration::seconds(1)));
        let mut job = noop_job(JobId(1), trigger);
        job.coalesce = true;
        job.set_next_run_time(Some(start));

        let (run_times, missed) = job.pending_run_times(Utc::now());
        assert_eq!(run_times.len(), 1);
        assert!(missed.is_empty(), "coalesced-away candidates are not misfires");
    }

    #[test]
    fn misfire_grace_time_zero_drops_any_late_fire() {
        let start = Utc::now() - chrono::Duration::seconds(5);
        let trigger: Arc<dyn Trigger<Utc>> =
            Arc::new(crate::trigger::IntervalTrigger::new(start, chrono::Duration::seconds(1)));
        let mut job = noop_job(JobId(1), trigger);
        job.misfire_grace_time = Some(0);
        job.set_next_run_time(Some(start));

        let (run_times, missed) = job.pending_run_times(Utc::now());
        assert!(run_times.is_empty());
        assert!(!missed.is_empty(), "the dropped fires must be reported as missed");
    }
}
