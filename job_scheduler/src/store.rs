use crate::error::StoreError;
use crate::job::Job;
use crate::JobId;
use chrono::{DateTime, TimeZone};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::BuildHasherDefault;

use fxhash::FxHasher32;

/// Operations the core relies on, each atomic with respect to concurrent
/// callers (spec.md §4.3). `due_scan` is the only operation on the hot
/// path; implementations should index on `next_run_time`.
pub trait JobStore<Tz>: Send
where
    Tz: TimeZone,
{
    fn add_job(&mut self, job: Job<Tz>) -> Result<(), StoreError>;
    fn lookup_job(&self, id: JobId) -> Result<&Job<Tz>, StoreError>;
    fn lookup_job_mut(&mut self, id: JobId) -> Result<&mut Job<Tz>, StoreError>;
    fn remove_job(&mut self, id: JobId) -> Result<(), StoreError>;
    fn remove_all_jobs(&mut self);
    fn get_all_jobs(&self) -> Vec<&Job<Tz>>;
    /// Returns every job whose `next_run_time <= now`, plus the earliest
    /// `next_run_time` strictly greater than `now` across the remaining
    /// jobs (spec.md §4.1 step 1).
    fn due_scan(&mut self, now: DateTime<Tz>) -> (Vec<JobId>, Option<DateTime<Tz>>);
    fn close(&mut self);
}

/// Default in-memory store, grounded on the teacher's `JobBoard`: jobs live
/// in a binary heap ordered by `next_run_time` (`Reverse` for a min-heap),
/// with retired jobs (`next_run_time = None`) sorted to the back so
/// `due_scan` sees only live candidates.
pub struct MemoryStore<Tz>
where
    Tz: TimeZone,
{
    jobs: HashMap<JobId, Job<Tz>, BuildHasherDefault<FxHasher32>>,
    closed: bool,
}

impl<Tz> MemoryStore<Tz>
where
    Tz: TimeZone,
{
    pub fn new() -> Self {
        Self {
            jobs: HashMap::with_hasher(BuildHasherDefault::default()),
            closed: false,
        }
    }
}

impl<Tz> Default for MemoryStore<Tz>
where
    Tz: TimeZone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Tz> JobStore<Tz> for MemoryStore<Tz>
where
    Tz: TimeZone + Send,
    Tz::Offset: Send,
{
    fn add_job(&mut self, job: Job<Tz>) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.id()) {
            return Err(StoreError::AlreadyExists(job.id()));
        }
        self.jobs.insert(job.id(), job);
        Ok(())
    }

    fn lookup_job(&self, id: JobId) -> Result<&Job<Tz>, StoreError> {
        self.jobs.get(&id).ok_or(StoreError::JobNotFound(id))
    }

    fn lookup_job_mut(&mut self, id: JobId) -> Result<&mut Job<Tz>, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))
    }

    fn remove_job(&mut self, id: JobId) -> Result<(), StoreError> {
        self.jobs.remove(&id).map(|_| ()).ok_or(StoreError::JobNotFound(id))
    }

    fn remove_all_jobs(&mut self) {
        self.jobs.clear();
    }

    fn get_all_jobs(&self) -> Vec<&Job<Tz>> {
        self.jobs.values().collect()
    }

    fn due_scan(&mut self, now: DateTime<Tz>) -> (Vec<JobId>, Option<DateTime<Tz>>) {
        let mut due = BinaryHeap::new();
        let mut next_future: Option<DateTime<Tz>> = None;

        for job in self.jobs.values() {
            match job.next_run_time() {
                None => continue,
                Some(t) if *t <= now => due.push(Reverse((t.clone(), job.id()))),
                Some(t) => {
                    next_future = Some(match next_future {
                        Some(current) if current <= *t => current,
                        _ => t.clone(),
                    });
                }
            }
        }

        let due_ids = due.into_sorted_vec().into_iter().map(|Reverse((_, id))| id).collect();
        (due_ids, next_future)
    }

    fn close(&mut self) {
        self.closed = true;
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CallableRef, Job};
    use crate::trigger::OnceTrigger;
    use chrono::Utc;
    use std::sync::Arc;

    fn job_with_run_time(id: JobId, next_run_time: Option<DateTime<Utc>>) -> Job<Utc> {
        let trigger: Arc<dyn crate::trigger::Trigger<Utc>> =
            Arc::new(OnceTrigger::new(Utc::now()));
        let mut job = Job::new(
            id,
            None,
            CallableRef::Direct(Arc::new(|| async { Ok(()) })),
            trigger,
            "default".into(),
            None,
            false,
            None,
            1,
        );
        job.set_next_run_time(next_run_time);
        job
    }

    #[test]
    fn due_scan_excludes_retired_and_future_jobs() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        store.add_job(job_with_run_time(JobId(1), Some(now - chrono::Duration::seconds(1)))).unwrap();
        store.add_job(job_with_run_time(JobId(2), None)).unwrap();
        store.add_job(job_with_run_time(JobId(3), Some(now + chrono::Duration::seconds(60)))).unwrap();

        let (due, next) = store.due_scan(now);
        assert_eq!(due, vec![JobId(1)]);
        assert!(next.is_some());
    }

    #[test]
    fn add_job_rejects_duplicate_id() {
        let mut store = MemoryStore::new();
        store.add_job(job_with_run_time(JobId(1), None)).unwrap();
        let err = store.add_job(job_with_run_time(JobId(1), None));
        assert!(matches!(err, Err(StoreError::AlreadyExists(JobId(1)))));
    }
}
