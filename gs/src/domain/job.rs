//! Job - the unit of schedulable work and its state machine
//!
//! ```text
//! QUEUED -> WAITING -> RUNNING -> DONE | FAILED | RETRY_WAIT
//! RETRY_WAIT -> WAITING
//! any non-terminal -> CANCELED | FAILED
//! ```
//!
//! Identity, owner and kind are fixed at construction. State, retry count and
//! priority change only through methods that verify the caller holds the
//! job's [`GeneralizedLock`] in write mode.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::ErrorKind;
use crate::sync::{GeneralizedLock, LockOwner};

use super::id::{JobId, RequestId};
use super::kind::JobKind;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Waiting,
    Running,
    RetryWait,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Waiting) | (Waiting, Running) | (RetryWait, Waiting) => true,
            (Running, Done | RetryWait) => true,
            (from, Failed | Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Running => write!(f, "RUNNING"),
            Self::RetryWait => write!(f, "RETRY_WAIT"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Job state-machine contract violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition { id: JobId, from: JobState, to: JobState },

    #[error("job {id}: {owner} does not hold the write lock")]
    LockNotHeld { id: JobId, owner: LockOwner },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Contract
    }
}

#[derive(Debug)]
struct JobFields {
    state: JobState,
    retry_count: u32,
    priority: i64,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Serializable view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub owner: String,
    pub kind: JobKind,
    pub request: Option<RequestId>,
    pub state: JobState,
    pub retry_count: u32,
    pub priority: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One schedulable unit of work
#[derive(Debug)]
pub struct Job {
    id: JobId,
    owner: String,
    kind: JobKind,
    request: Option<RequestId>,
    created_at: DateTime<Utc>,
    born: Instant,
    lifetime: Duration,
    lock: GeneralizedLock,
    cancel: CancellationToken,
    fields: Mutex<JobFields>,
}

impl Job {
    pub fn new(id: JobId, owner: impl Into<String>, kind: JobKind, lifetime: Duration) -> Self {
        let owner = owner.into();
        debug!(%id, %owner, %kind, ?lifetime, "Job::new: called");
        let now = Utc::now();
        Self {
            id,
            owner,
            kind,
            request: None,
            created_at: now,
            born: Instant::now(),
            lifetime,
            lock: GeneralizedLock::new(),
            cancel: CancellationToken::new(),
            fields: Mutex::new(JobFields {
                state: JobState::Queued,
                retry_count: 0,
                priority: 0,
                last_error: None,
                updated_at: now,
            }),
        }
    }

    /// Attach the job to its parent compound request
    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    fn fields(&self) -> MutexGuard<'_, JobFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Lock guarding this job's mutable state
    pub fn lock(&self) -> &GeneralizedLock {
        &self.lock
    }

    pub fn state(&self) -> JobState {
        self.fields().state
    }

    pub fn retry_count(&self) -> u32 {
        self.fields().retry_count
    }

    pub fn priority(&self) -> i64 {
        self.fields().priority
    }

    pub fn last_error(&self) -> Option<String> {
        self.fields().last_error.clone()
    }

    /// Time left before the job's lifetime runs out
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.lifetime
            .checked_sub(self.born.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_lifetime().is_none()
    }

    /// Raise the cooperative cancel flag
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn locked_fields(&self, owner: LockOwner) -> Result<MutexGuard<'_, JobFields>, JobError> {
        if !self.lock.holds_write(owner) {
            error!(id = %self.id, %owner, "Job: mutation without write lock");
            return Err(JobError::LockNotHeld { id: self.id, owner });
        }
        Ok(self.fields())
    }

    fn apply(&self, fields: &mut JobFields, next: JobState) -> Result<JobState, JobError> {
        let from = fields.state;
        if !from.can_transition_to(next) {
            error!(id = %self.id, %from, to = %next, "Job: illegal transition");
            return Err(JobError::IllegalTransition {
                id: self.id,
                from,
                to: next,
            });
        }
        fields.state = next;
        fields.updated_at = Utc::now();
        debug!(id = %self.id, %from, to = %next, "Job: transition");
        Ok(from)
    }

    /// Move to `next`; returns the previous state
    pub fn transition(&self, owner: LockOwner, next: JobState) -> Result<JobState, JobError> {
        let mut fields = self.locked_fields(owner)?;
        self.apply(&mut fields, next)
    }

    /// Move to FAILED, preserving `error` as the last error
    pub fn fail(&self, owner: LockOwner, error: impl Into<String>) -> Result<JobState, JobError> {
        let mut fields = self.locked_fields(owner)?;
        let from = self.apply(&mut fields, JobState::Failed)?;
        fields.last_error = Some(error.into());
        Ok(from)
    }

    /// Move RUNNING -> RETRY_WAIT and count the attempt; returns the new retry count
    pub fn retry(&self, owner: LockOwner, error: impl Into<String>) -> Result<u32, JobError> {
        let mut fields = self.locked_fields(owner)?;
        self.apply(&mut fields, JobState::RetryWait)?;
        fields.retry_count += 1;
        fields.last_error = Some(error.into());
        Ok(fields.retry_count)
    }

    pub fn set_priority(&self, owner: LockOwner, priority: i64) -> Result<(), JobError> {
        self.locked_fields(owner)?.priority = priority;
        Ok(())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let fields = self.fields();
        JobSnapshot {
            id: self.id,
            owner: self.owner.clone(),
            kind: self.kind,
            request: self.request,
            state: fields.state,
            retry_count: fields.retry_count,
            priority: fields.priority,
            last_error: fields.last_error.clone(),
            created_at: self.created_at,
            updated_at: fields.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId::new(1), "alice", JobKind::Get, Duration::from_secs(60))
    }

    #[test]
    fn test_allowed_transitions() {
        use JobState::*;
        assert!(Queued.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(RetryWait));
        assert!(RetryWait.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Canceled));
        assert!(RetryWait.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Running));
        assert!(!Waiting.can_transition_to(Done));
        assert!(!RetryWait.can_transition_to(Running));
        assert!(!Done.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Waiting));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[tokio::test]
    async fn test_running_requires_write_lock() {
        let job = job();
        let owner = LockOwner::next();

        assert_eq!(
            job.transition(owner, JobState::Waiting).unwrap_err(),
            JobError::LockNotHeld { id: job.id(), owner }
        );

        job.lock().acquire_read(owner).await.unwrap();
        assert!(job.transition(owner, JobState::Waiting).is_err());
        job.lock().release(owner).unwrap();

        job.lock().acquire_write(owner).await.unwrap();
        job.transition(owner, JobState::Waiting).unwrap();
        job.transition(owner, JobState::Running).unwrap();
        job.lock().release(owner).unwrap();
        assert_eq!(job.state(), JobState::Running);

        let other = LockOwner::next();
        assert!(job.transition(other, JobState::Done).is_err());
        assert_eq!(job.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state() {
        let job = job();
        let owner = LockOwner::next();
        job.lock().acquire_write(owner).await.unwrap();

        let err = job.transition(owner, JobState::Done).unwrap_err();
        assert_eq!(
            err,
            JobError::IllegalTransition {
                id: job.id(),
                from: JobState::Queued,
                to: JobState::Done
            }
        );
        assert_eq!(err.kind(), ErrorKind::Contract);
        assert_eq!(job.state(), JobState::Queued);
    }

    #[tokio::test]
    async fn test_retry_and_fail_record_error() {
        let job = job();
        let owner = LockOwner::next();
        job.lock().acquire_write(owner).await.unwrap();

        job.transition(owner, JobState::Waiting).unwrap();
        job.transition(owner, JobState::Running).unwrap();
        assert_eq!(job.retry(owner, "pool offline").unwrap(), 1);
        assert_eq!(job.state(), JobState::RetryWait);

        job.transition(owner, JobState::Waiting).unwrap();
        job.transition(owner, JobState::Running).unwrap();
        job.fail(owner, "no such file").unwrap();

        let snapshot = job.snapshot();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.retry_count, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("no such file"));
    }

    #[test]
    fn test_lifetime() {
        let expired = Job::new(JobId::new(2), "bob", JobKind::Ls, Duration::ZERO);
        assert!(expired.is_expired());
        assert!(!job().is_expired());
        assert!(job().remaining_lifetime().unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn test_cancel_flag() {
        let job = job().with_request(RequestId::new(9));
        assert!(!job.is_cancel_requested());
        job.request_cancel();
        assert!(job.is_cancel_requested());
        assert_eq!(job.request(), Some(RequestId::new(9)));
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&JobState::RetryWait).unwrap();
        assert_eq!(json, "\"RETRY_WAIT\"");
        assert_eq!(JobState::RetryWait.to_string(), "RETRY_WAIT");
    }
}
