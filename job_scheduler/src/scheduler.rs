use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::event::{Event, EventBus, EventKind, ListenerId};
use crate::executor::{Executor, ThreadPoolExecutor};
use crate::job::{Job, JobBuilder, JobChange};
use crate::store::{JobStore, MemoryStore};
use crate::{JobId, SchedulerConfig};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

const DEFAULT_ALIAS: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
}

/// A value-like reference to a job: store alias plus id, looked up on the
/// live scheduler on each use (spec.md §9 design note). Holds no
/// back-pointer to the scheduler that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub store_alias: String,
    pub id: JobId,
}

struct PendingJob<Tz>
where
    Tz: TimeZone,
{
    job: Job<Tz>,
    store_alias: String,
}

struct Registry<Tz>
where
    Tz: TimeZone,
{
    stores: HashMap<String, Box<dyn JobStore<Tz>>>,
    pending: Vec<PendingJob<Tz>>,
}

impl<Tz> Registry<Tz>
where
    Tz: TimeZone,
{
    fn new() -> Self {
        Self {
            stores: HashMap::new(),
            pending: Vec::new(),
        }
    }
}

/// The scheduler core: lifecycle state machine, executor and store
/// registries, the pending-jobs staging area, and `process_due()`.
///
/// Grounded on the teacher's `Scheduler<T>` (`scheduler.rs`) for the overall
/// shape -- a long-lived object owning registries behind independent
/// locks -- and on `original_source/apscheduler/schedulers/base.py`'s
/// `BaseScheduler` for the exact mutation-API and firing-loop semantics.
pub struct Scheduler<Tz>
where
    Tz: TimeZone,
{
    clock: Arc<dyn Clock<Tz>>,
    config: SchedulerConfig,
    state: Mutex<RunState>,
    next_id: AtomicU32,
    executors: Mutex<HashMap<String, Arc<dyn Executor<Tz>>>>,
    registry: Mutex<Registry<Tz>>,
    events: Arc<EventBus>,
    wakeup: Notify,
    clock_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl Scheduler<Utc> {
    /// Builds a scheduler running in UTC with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(Utc, SchedulerConfig::default())
    }
}

impl<Tz> Scheduler<Tz>
where
    Tz: TimeZone + Clone + Send + Sync + 'static,
    Tz::Offset: Send + Sync,
{
    pub fn with_config(timezone: Tz, config: SchedulerConfig) -> Arc<Self> {
        Self::with_clock(Arc::new(crate::clock::SystemClock::new(timezone)), config)
    }

    /// Builds a scheduler driven by a caller-supplied clock, e.g. a
    /// [`crate::clock::TestClock`] for deterministic end-to-end tests.
    pub fn with_clock(clock: Arc<dyn Clock<Tz>>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            clock,
            config,
            state: Mutex::new(RunState::Stopped),
            next_id: AtomicU32::new(1),
            executors: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::new()),
            events: Arc::new(EventBus::new()),
            wakeup: Notify::new(),
            clock_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    fn now(&self) -> DateTime<Tz> {
        self.clock.now()
    }

    fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == RunState::Running
    }

    /// Registers an independent event listener, filtered by `mask`. Returns
    /// an id that identifies this exact registration for `remove_listener`.
    pub fn add_listener<F>(&self, callback: F, mask: EventKind) -> ListenerId
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.events.add_listener(callback, mask)
    }

    /// Removes the listener registered under `id`.
    pub fn remove_listener(&self, id: ListenerId) {
        self.events.remove_listener(id);
    }

    /// Registers an executor under `alias`. Starts it immediately if the
    /// scheduler is already running (spec.md §4.1).
    pub fn add_executor(
        &self,
        alias: impl Into<String>,
        executor: Arc<dyn Executor<Tz>>,
    ) -> Result<(), SchedulerError> {
        let alias = alias.into();
        let mut executors = self.executors.lock().unwrap();
        if executors.contains_key(&alias) {
            return Err(SchedulerError::AliasInUse(alias));
        }
        if self.is_running() {
            executor.start(self.events.clone());
        }
        executors.insert(alias, executor);
        Ok(())
    }

    /// Registers a job store under `alias`. If running and `quiet` is
    /// false, requests a wakeup since the new store may already hold due
    /// jobs (spec.md §4.1).
    pub fn add_jobstore(
        &self,
        alias: impl Into<String>,
        store: Box<dyn JobStore<Tz>>,
        quiet: bool,
    ) -> Result<(), SchedulerError> {
        let alias = alias.into();
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.stores.contains_key(&alias) {
                return Err(SchedulerError::AliasInUse(alias));
            }
            registry.stores.insert(alias.clone(), store);
        }
        self.events.notify(Event::new(EventKind::JOBSTORE_ADDED).with_store(alias));
        if self.is_running() && !quiet {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// Removes the store registered under `alias`, optionally closing it.
    pub fn remove_jobstore(&self, alias: &str, close: bool) -> Result<(), SchedulerError> {
        let mut registry = self.registry.lock().unwrap();
        let mut store = registry
            .stores
            .remove(alias)
            .ok_or_else(|| SchedulerError::NoSuchAlias(alias.to_string()))?;
        if close {
            store.close();
        }
        drop(registry);
        self.events.notify(Event::new(EventKind::JOBSTORE_REMOVED).with_store(alias.to_string()));
        Ok(())
    }

    /// Constructs a job from `builder` and either parks it in the pending
    /// list (scheduler not yet running) or inserts it directly into its
    /// target store (spec.md §4.1).
    pub fn add_job(&self, builder: JobBuilder<Tz>) -> Result<JobHandle, SchedulerError> {
        let store_alias = builder.jobstore_alias().to_string();
        let id = match builder.id_requested() {
            Some(id) => id,
            None => self.allocate_id(),
        };
        let now = self.now();
        let job = builder.build(id, now.clone(), self.config.misfire_grace_time, self.config.coalesce);

        if !self.is_running() {
            let mut registry = self.registry.lock().unwrap();
            registry.pending.push(PendingJob { job, store_alias: store_alias.clone() });
            return Ok(JobHandle { store_alias, id });
        }

        self.real_add_job(job, &store_alias, now)?;
        Ok(JobHandle { store_alias, id })
    }

    /// Computes `next_run_time`, inserts into the named store, emits
    /// `JOB_ADDED`, and requests a wakeup. Per spec.md §9's resolution of
    /// "trigger yields `None` on first evaluation": a trigger with no fire
    /// times at all is never inserted in the first place, so no dead job
    /// lingers in the store.
    fn real_add_job(
        &self,
        mut job: Job<Tz>,
        store_alias: &str,
        now: DateTime<Tz>,
    ) -> Result<(), SchedulerError> {
        if job.next_run_time().is_none() && job.runs() == 0 {
            job.compute_initial_run_time(now);
        }
        if job.is_retired() {
            return Ok(());
        }
        let id = job.id();
        let mut registry = self.registry.lock().unwrap();
        let store = registry
            .stores
            .get_mut(store_alias)
            .ok_or_else(|| SchedulerError::NoSuchAlias(store_alias.to_string()))?;
        store
            .add_job(job)
            .map_err(|_| SchedulerError::AliasInUse(format!("job {id}")))?;
        drop(registry);
        self.events.notify(
            Event::new(EventKind::JOB_ADDED).with_store(store_alias.to_string()).with_job(id),
        );
        self.wakeup.notify_one();
        Ok(())
    }

    /// Applies `changes` to the job identified by `id`/`store_alias`,
    /// whether it is still pending or already persisted in a store.
    pub fn modify_job(
        &self,
        id: JobId,
        store_alias: &str,
        changes: Vec<JobChange<Tz>>,
    ) -> Result<(), SchedulerError> {
        let mut registry = self.registry.lock().unwrap();

        if let Some(pending) = registry.pending.iter_mut().find(|p| p.job.id() == id) {
            for change in changes {
                pending.job.apply_change(change)?;
            }
            return Ok(());
        }

        let store = registry
            .stores
            .get_mut(store_alias)
            .ok_or_else(|| SchedulerError::NoSuchAlias(store_alias.to_string()))?;
        let job = store.lookup_job_mut(id).map_err(|_| SchedulerError::JobNotFound(id))?;
        if changes.is_empty() {
            return Ok(());
        }
        for change in changes {
            job.apply_change(change)?;
        }
        drop(registry);

        self.events.notify(
            Event::new(EventKind::JOB_MODIFIED).with_store(store_alias.to_string()).with_job(id),
        );
        self.wakeup.notify_one();
        Ok(())
    }

    /// Removes the job identified by `id`, whether pending or persisted.
    pub fn remove_job(&self, id: JobId, store_alias: &str) -> Result<(), SchedulerError> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(pos) = registry.pending.iter().position(|p| p.job.id() == id) {
            registry.pending.remove(pos);
            return Ok(());
        }

        let store = registry
            .stores
            .get_mut(store_alias)
            .ok_or_else(|| SchedulerError::NoSuchAlias(store_alias.to_string()))?;
        store.remove_job(id).map_err(|_| SchedulerError::JobNotFound(id))?;
        drop(registry);

        self.events.notify(
            Event::new(EventKind::JOB_REMOVED).with_store(store_alias.to_string()).with_job(id),
        );
        Ok(())
    }

    /// Removes every job from `store_alias`, or from every registered store
    /// if `None`. Emits `JOBSTORE_CLEARED` once per affected store rather
    /// than one `JOB_REMOVED` per job (spec.md §9).
    pub fn remove_all_jobs(&self, store_alias: Option<&str>) {
        let mut registry = self.registry.lock().unwrap();
        let aliases: Vec<String> = match store_alias {
            Some(alias) => vec![alias.to_string()],
            None => {
                registry.pending.clear();
                registry.stores.keys().cloned().collect()
            }
        };
        for alias in &aliases {
            if let Some(store) = registry.stores.get_mut(alias) {
                store.remove_all_jobs();
            }
        }
        drop(registry);
        for alias in aliases {
            self.events.notify(Event::new(EventKind::JOBSTORE_CLEARED).with_store(alias));
        }
    }

    /// Returns handles for pending and/or persisted jobs, filtered by store
    /// alias and pending/persisted status.
    pub fn get_jobs(&self, store_alias: Option<&str>, pending: Option<bool>) -> Vec<JobHandle> {
        let registry = self.registry.lock().unwrap();
        let mut out = Vec::new();

        if pending != Some(false) {
            for p in &registry.pending {
                let matches_alias = match store_alias {
                    Some(alias) => alias == p.store_alias,
                    None => true,
                };
                if matches_alias {
                    out.push(JobHandle { store_alias: p.store_alias.clone(), id: p.job.id() });
                }
            }
        }

        if pending != Some(true) {
            for (alias, store) in &registry.stores {
                if let Some(wanted) = store_alias {
                    if wanted != alias {
                        continue;
                    }
                }
                for job in store.get_all_jobs() {
                    out.push(JobHandle { store_alias: alias.clone(), id: job.id() });
                }
            }
        }

        out
    }

    pub fn get_job(&self, id: JobId, store_alias: &str) -> Result<JobHandle, SchedulerError> {
        let registry = self.registry.lock().unwrap();
        if registry.pending.iter().any(|p| p.job.id() == id && p.store_alias == store_alias) {
            return Ok(JobHandle { store_alias: store_alias.to_string(), id });
        }
        let store = registry
            .stores
            .get(store_alias)
            .ok_or_else(|| SchedulerError::NoSuchAlias(store_alias.to_string()))?;
        store
            .lookup_job(id)
            .map(|_| JobHandle { store_alias: store_alias.to_string(), id })
            .map_err(|_| SchedulerError::JobNotFound(id))
    }

    /// Reads back a snapshot of the job behind `handle`, for introspection
    /// (e.g. tests asserting on `next_run_time`/`runs`). `JobHandle` itself
    /// stays identity-only per the value-like design; this is the seam for
    /// callers that need the fields.
    pub fn job_state(&self, handle: &JobHandle) -> Option<Job<Tz>> {
        let registry = self.registry.lock().unwrap();
        if let Some(pending) = registry.pending.iter().find(|p| p.job.id() == handle.id) {
            return Some(pending.job.clone());
        }
        registry.stores.get(&handle.store_alias)?.lookup_job(handle.id).ok().cloned()
    }

    /// Starts the scheduler: installs default executor/store if missing,
    /// starts every executor, flushes pending jobs, transitions to
    /// running, emits `SCHEDULER_STARTED`, and spawns the background
    /// firing-loop task (spec.md §4.1 `start()`).
    pub async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == RunState::Running {
                return Err(SchedulerError::AlreadyRunning);
            }
            *state = RunState::Running;
        }

        {
            let mut executors = self.executors.lock().unwrap();
            if !executors.contains_key(DEFAULT_ALIAS) {
                let default: Arc<dyn Executor<Tz>> = Arc::new(ThreadPoolExecutor::new());
                executors.insert(DEFAULT_ALIAS.to_string(), default);
            }
            for executor in executors.values() {
                executor.start(self.events.clone());
            }
        }

        {
            let mut registry = self.registry.lock().unwrap();
            if !registry.stores.contains_key(DEFAULT_ALIAS) {
                registry.stores.insert(DEFAULT_ALIAS.to_string(), Box::new(MemoryStore::new()));
            }
            let pending = std::mem::take(&mut registry.pending);
            drop(registry);
            for PendingJob { job, store_alias } in pending {
                let now = self.now();
                if let Err(err) = self.real_add_job(job, &store_alias, now) {
                    log::error!(target: "job_scheduler::scheduler::Scheduler::start", "failed to flush pending job into {store_alias}: {err}");
                }
            }
        }

        self.events.notify(Event::new(EventKind::SCHEDULER_STARTED));

        let me = self.self_ref.upgrade().expect("scheduler dropped while starting");
        let handle = tokio::spawn(async move { me.run_clock().await });
        *self.clock_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// The embedder-supplied loop spec.md describes: call `process_due()`,
    /// sleep for the returned duration (or until woken), repeat.
    async fn run_clock(self: Arc<Self>) {
        loop {
            if !self.is_running() {
                return;
            }
            let wait = self.process_due();
            match wait {
                Some(duration) if duration > chrono::Duration::zero() => {
                    let std_duration = duration.to_std().unwrap_or(std::time::Duration::from_secs(0));
                    tokio::select! {
                        _ = tokio::time::sleep(std_duration) => {}
                        _ = self.wakeup.notified() => {}
                    }
                }
                Some(_) => {
                    // Due again already (e.g. a rejected submission keeps
                    // retrying): yield once so other tasks get a turn
                    // instead of spinning the executor.
                    tokio::task::yield_now().await;
                }
                None => {
                    self.wakeup.notified().await;
                }
            }
        }
    }

    /// Shuts down every executor (honoring `wait`), closes every store,
    /// transitions to stopped, and emits `SCHEDULER_SHUTDOWN`.
    pub async fn shutdown(&self, wait: bool) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RunState::Running {
                return Err(SchedulerError::NotRunning);
            }
            *state = RunState::Stopped;
        }
        self.wakeup.notify_one();

        if let Some(handle) = self.clock_task.lock().unwrap().take() {
            let _ = handle.await;
        }

        {
            let executors = self.executors.lock().unwrap();
            for executor in executors.values() {
                executor.shutdown(wait);
            }
        }
        {
            let mut registry = self.registry.lock().unwrap();
            for store in registry.stores.values_mut() {
                store.close();
            }
        }

        self.events.notify(Event::new(EventKind::SCHEDULER_SHUTDOWN));
        Ok(())
    }

    /// Requests that the firing loop re-evaluate immediately instead of
    /// waiting out its current sleep. Idempotent, non-blocking.
    pub fn request_wakeup(&self) {
        self.wakeup.notify_one();
    }

    /// Scans every registered store for due jobs, submits them to their
    /// executors, and updates or retires each job afterward. Returns how
    /// long the caller should sleep before calling again, or `None` if no
    /// job is pending anywhere (spec.md §4.1 `process_due`).
    pub fn process_due(&self) -> Option<chrono::Duration> {
        let now = self.now();
        let mut next_wakeup: Option<DateTime<Tz>> = None;

        let aliases: Vec<String> = {
            let registry = self.registry.lock().unwrap();
            registry.stores.keys().cloned().collect()
        };

        for alias in aliases {
            let (due_ids, store_next) = {
                let mut registry = self.registry.lock().unwrap();
                let Some(store) = registry.stores.get_mut(&alias) else { continue };
                store.due_scan(now.clone())
            };
            fold_min(&mut next_wakeup, store_next);

            for id in due_ids {
                self.process_one_due_job(&alias, id, now.clone(), &mut next_wakeup);
            }
        }

        next_wakeup.map(|t| t - now)
    }

    /// Handles one job reported due by `due_scan`. Per spec.md §5's locking
    /// discipline, no lock is held across `Executor::submit` or an event
    /// callback: the job is snapshotted (cloned) out of its store first,
    /// submitted, and only then is the store re-locked to persist the
    /// result.
    fn process_one_due_job(
        &self,
        alias: &str,
        id: JobId,
        now: DateTime<Tz>,
        next_wakeup: &mut Option<DateTime<Tz>>,
    ) {
        let snapshot = {
            let mut registry = self.registry.lock().unwrap();
            let Some(store) = registry.stores.get_mut(alias) else { return };
            match store.lookup_job(id) {
                Ok(job) => job.clone(),
                Err(_) => return,
            }
        };

        if snapshot.is_retired() {
            return;
        }

        let (run_times, missed) = snapshot.pending_run_times(now.clone());
        for candidate in missed {
            self.events.notify(
                Event::new(EventKind::JOB_MISSED)
                    .with_store(alias.to_string())
                    .with_job(id)
                    .with_run_time(candidate.with_timezone(&Utc)),
            );
        }
        if run_times.is_empty() {
            return;
        }

        let executor = {
            let executors = self.executors.lock().unwrap();
            let Some(executor) = executors.get(snapshot.executor_alias()) else {
                log::error!(target: "job_scheduler::scheduler::Scheduler::process_due", "no such executor alias: {}", snapshot.executor_alias());
                return;
            };
            executor.clone()
        };
        let submission = executor.submit(&snapshot, run_times.clone());

        if let Err(err) = submission {
            log::warn!(target: "job_scheduler::scheduler::Scheduler::process_due", "submission for job {id} failed: {err}");
            fold_min(next_wakeup, snapshot.next_run_time().cloned());
            return;
        }

        let epsilon = chrono::Duration::nanoseconds(1);
        let new_next = snapshot.trigger().next_fire_time(now.clone() + epsilon);
        let new_runs = snapshot.runs() + run_times.len() as u32;
        let still_has_budget = match snapshot.max_runs() {
            Some(max) => new_runs < max,
            None => true,
        };

        let mut registry = self.registry.lock().unwrap();
        let Some(store) = registry.stores.get_mut(alias) else { return };
        match new_next.filter(|_| still_has_budget) {
            Some(next) => {
                if let Ok(job) = store.lookup_job_mut(id) {
                    job.set_next_run_time(Some(next.clone()));
                    job.set_runs(new_runs);
                }
                fold_min(next_wakeup, Some(next));
            }
            None => {
                let _ = store.remove_job(id);
            }
        }
    }
}

fn fold_min<Tz: TimeZone>(acc: &mut Option<DateTime<Tz>>, candidate: Option<DateTime<Tz>>) {
    let Some(candidate) = candidate else { return };
    *acc = Some(match acc.take() {
        Some(current) if current <= candidate => current,
        _ => candidate,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn noop_builder() -> JobBuilder<Utc> {
        JobBuilder::new(|| async { Ok(()) })
    }

    #[tokio::test]
    async fn pending_job_flushes_on_start() {
        let scheduler = Scheduler::new();
        let handle = scheduler.add_job(noop_builder()).unwrap();
        assert!(!scheduler.is_running());

        let jobs = scheduler.get_jobs(None, Some(true));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, handle.id);

        scheduler.start().await.unwrap();
        let jobs = scheduler.get_jobs(None, Some(true));
        assert!(jobs.is_empty());
        scheduler.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_job_runs_then_is_retired() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        scheduler.add_listener(
            move |event| {
                if event.kind == EventKind::JOB_EXECUTED {
                    ran2.fetch_add(1, AtomicOrdering::SeqCst);
                }
            },
            EventKind::ALL,
        );
        scheduler.add_job(noop_builder()).unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(scheduler.get_jobs(None, None).is_empty());
        scheduler.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn double_start_fails_with_already_running() {
        let scheduler = Scheduler::new();
        scheduler.start().await.unwrap();
        let err = scheduler.start().await;
        assert!(matches!(err, Err(SchedulerError::AlreadyRunning)));
        scheduler.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn remove_all_jobs_clears_pending_and_stored() {
        let scheduler = Scheduler::new();
        scheduler.add_job(noop_builder()).unwrap();
        scheduler.start().await.unwrap();
        scheduler.add_job(noop_builder()).unwrap();

        scheduler.remove_all_jobs(None);
        assert!(scheduler.get_jobs(None, None).is_empty());
        scheduler.shutdown(false).await.unwrap();
    }
}
