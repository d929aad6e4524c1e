//! Scheduler error types

use thiserror::Error;

use crate::domain::{JobError, JobId, JobKind, JobState};
use crate::error::ErrorKind;
use crate::sync::LockError;

/// Which admission bound refused a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityReason {
    /// Waiting queue is at `max-queue-size`
    QueueFull,
    /// WAITING jobs are at `max-waiting-jobs`
    WaitingJobsExceeded,
    /// The owner has `max-running-by-owner` jobs RUNNING
    OwnerRunningLimit,
}

impl std::fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "waiting queue full"),
            Self::WaitingJobsExceeded => write!(f, "too many waiting jobs"),
            Self::OwnerRunningLimit => write!(f, "owner running limit reached"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{scheduler}: job {job} refused: {reason}")]
    CapacityExceeded {
        scheduler: String,
        job: JobId,
        reason: CapacityReason,
    },

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} is already known to the scheduler")]
    DuplicateJob(JobId),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("job {job} is still {state}")]
    NotTerminal { job: JobId, state: JobState },

    #[error("{0}: scheduler is shutting down")]
    ShuttingDown(String),

    #[error("no scheduler configured for {0}")]
    UnknownKind(JobKind),

    #[error("{scheduler} runs {expected} jobs, got {actual}")]
    WrongKind {
        scheduler: String,
        expected: JobKind,
        actual: JobKind,
    },

    #[error("no job body registered for {0}")]
    NoBody(JobKind),

    #[error("invalid configuration for {scheduler}: {reason}")]
    InvalidConfig { scheduler: String, reason: String },

    #[error("retry timer is not running")]
    RetryTimerClosed,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } | Self::ShuttingDown(_) => ErrorKind::Capacity,
            Self::Job(e) => e.kind(),
            Self::Lock(e) => e.kind(),
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RetryTimerClosed => ErrorKind::Terminal,
            Self::UnknownJob(_)
            | Self::DuplicateJob(_)
            | Self::NotTerminal { .. }
            | Self::UnknownKind(_)
            | Self::WrongKind { .. }
            | Self::NoBody(_)
            | Self::InvalidConfig { .. } => ErrorKind::Contract,
        }
    }

    /// Whether submitting again later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
