use crate::JobId;
use thiserror::Error;

/// Errors raised directly to callers of the mutation API.
///
/// Mirrors the exception taxonomy of `apscheduler.schedulers.base`: lifecycle
/// errors and registry errors are surfaced to the caller, never swallowed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("alias \"{0}\" is already in use")]
    AliasInUse(String),
    #[error("no such alias: \"{0}\"")]
    NoSuchAlias(String),
    #[error("no such job: {0:?}")]
    JobNotFound(JobId),
    #[error("invalid change to job {job}: {reason}")]
    InvalidChange { job: JobId, reason: String },
}

/// Errors a [`crate::store::JobStore`] may raise. Kept separate from
/// [`SchedulerError`] since stores are external collaborators, not the core.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job id {0:?} already exists in this store")]
    AlreadyExists(JobId),
    #[error("no such job: {0:?}")]
    JobNotFound(JobId),
    #[error("job store is closed")]
    Closed,
}

/// Errors an [`crate::executor::Executor`] may raise from `submit`.
///
/// `MaxInstancesReached` is a capacity signal the firing loop catches and
/// logs at warning level without advancing the job's state (spec §7); any
/// other variant is logged at error level, also without advancing state.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job {job:?} already has {max_instances} instance(s) running")]
    MaxInstancesReached { job: JobId, max_instances: u32 },
    #[error("executor is shut down")]
    ShutDown,
    #[error("failed to submit job {0:?}: {1}")]
    SubmitFailed(JobId, String),
}
